//! Dispatcher -- drains the event queue for one run context.
//!
//! Single worker by default; `concurrency` allows a bounded pool. Either way
//! the producer contract is the same: follow-up events are enqueued only
//! after their input event finishes processing.

use crate::event::queue::EventQueue;
use crate::event::{Event, ProducerRegistry};
use crate::model::now_millis;
use crate::storage::Dao;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How a dispatcher run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The queue emptied with nothing in flight: natural completion.
    Drained,
    /// An external stop signal arrived; remaining work was discarded.
    Stopped,
}

/// Pluggable progress function: completed event count -> fraction in [0, 1].
pub type ProgressFn = Box<dyn Fn(u64) -> f64 + Send + Sync>;

pub struct Dispatcher {
    queue: EventQueue,
    registry: Arc<ProducerRegistry>,
    dao: Dao,
    run_id: i64,
    concurrency: usize,
    cancel: CancellationToken,
    progress: ProgressFn,
}

impl Dispatcher {
    pub fn new(
        initial_events: Vec<Event>,
        registry: ProducerRegistry,
        dao: Dao,
        run_id: i64,
        concurrency: usize,
        cancel: CancellationToken,
        progress: ProgressFn,
    ) -> Self {
        let mut queue = EventQueue::new();
        for ev in initial_events {
            queue.push(ev);
        }
        Self {
            queue,
            registry: Arc::new(registry),
            dao,
            run_id,
            concurrency: concurrency.max(1),
            cancel,
            progress,
        }
    }

    /// Process events until the queue drains or the stop signal arrives.
    /// A failing producer records a fail outcome for its event and the loop
    /// continues: one bad event never poisons the run.
    pub async fn run(mut self) -> DispatchOutcome {
        let mut inflight: JoinSet<(String, anyhow::Result<Vec<Event>>)> = JoinSet::new();
        let mut done: u64 = 0;
        let cancel = self.cancel.clone();

        loop {
            if cancel.is_cancelled() {
                inflight.abort_all();
                return DispatchOutcome::Stopped;
            }

            // Dispatch every due event the pool has room for
            let now = now_millis();
            while inflight.len() < self.concurrency {
                let Some(event) = self.queue.pop_due(now) else {
                    break;
                };
                let registry = Arc::clone(&self.registry);
                inflight.spawn(async move {
                    let name = event.name.clone();
                    let out = registry.produce(&event).await;
                    (name, out)
                });
            }

            if inflight.is_empty() && self.queue.is_empty() {
                return DispatchOutcome::Drained;
            }

            let next_wake = self.queue.next_wake();
            let can_dispatch_more = next_wake.is_some() && inflight.len() < self.concurrency;
            tokio::select! {
                joined = inflight.join_next(), if !inflight.is_empty() => {
                    done += 1;
                    match joined {
                        Some(Ok((name, Ok(outputs)))) => {
                            if outputs.is_empty() {
                                debug!(event = %name, "Producer ended its branch");
                            }
                            for out in outputs {
                                self.queue.push(out);
                            }
                            self.record(true, done);
                        }
                        Some(Ok((name, Err(e)))) => {
                            warn!(event = %name, run_id = self.run_id, "Event processing failed: {e:#}");
                            self.record(false, done);
                        }
                        Some(Err(join_err)) => {
                            error!(run_id = self.run_id, "Event task panicked: {join_err}");
                            self.record(false, done);
                        }
                        None => unreachable!("guarded by !inflight.is_empty()"),
                    }
                }
                _ = sleep_until(next_wake), if can_dispatch_more => {}
                _ = cancel.cancelled() => {
                    inflight.abort_all();
                    return DispatchOutcome::Stopped;
                }
            }
        }
    }

    fn record(&self, success: bool, done: u64) {
        let progress = (self.progress)(done).clamp(0.0, 1.0);
        if let Err(e) = self
            .dao
            .record_event_result(self.run_id, success, progress)
        {
            error!(run_id = self.run_id, "Failed to record event outcome: {e:#}");
        }
    }
}

async fn sleep_until(wake: Option<i64>) {
    match wake {
        Some(w) => {
            let now = now_millis();
            if w > now {
                tokio::time::sleep(Duration::from_millis((w - now) as u64)).await;
            }
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventProducer, TerminateProducer, TERMINATE_EVENT};
    use async_trait::async_trait;
    use r2d2_sqlite::SqliteConnectionManager;
    use uuid::Uuid;

    struct FanOut {
        children: usize,
    }

    #[async_trait]
    impl EventProducer for FanOut {
        async fn produce(&self, event: &Event) -> anyhow::Result<Vec<Event>> {
            Ok((0..self.children)
                .map(|_| Event::immediate(TERMINATE_EVENT, serde_json::Value::Null, event.session))
                .collect())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl EventProducer for AlwaysFails {
        async fn produce(&self, _event: &Event) -> anyhow::Result<Vec<Event>> {
            anyhow::bail!("synthetic producer failure")
        }
    }

    struct Stuck;

    #[async_trait]
    impl EventProducer for Stuck {
        async fn produce(&self, _event: &Event) -> anyhow::Result<Vec<Event>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    fn started_run() -> (Dao, i64) {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder().max_size(1).build(manager).unwrap();
        crate::storage::schema::migrate(&pool.get().unwrap()).unwrap();
        let dao = Dao::new(pool);
        dao.create_test("T1", None, None, None).unwrap();
        let run = dao.create_run("T1", "01", None, None, None).unwrap();
        let now = now_millis();
        dao.schedule_run("T1", "01", now, 0).unwrap();
        dao.mark_started(run.id, now).unwrap();
        (dao, run.id)
    }

    fn registry() -> ProducerRegistry {
        let mut r = ProducerRegistry::new();
        r.register("fan", Arc::new(FanOut { children: 3 }));
        r.register(TERMINATE_EVENT, Arc::new(TerminateProducer));
        r.register("bad", Arc::new(AlwaysFails));
        r.register("stuck", Arc::new(Stuck));
        r
    }

    #[tokio::test]
    async fn test_drains_when_every_branch_terminates() {
        let (dao, run_id) = started_run();
        let session = Uuid::new_v4();
        let seed = vec![Event::immediate("fan", serde_json::Value::Null, session)];
        let d = Dispatcher::new(
            seed,
            registry(),
            dao.clone(),
            run_id,
            1,
            CancellationToken::new(),
            Box::new(|done| done as f64 / 4.0),
        );
        assert_eq!(d.run().await, DispatchOutcome::Drained);
        let rec = dao.get_run("T1", "01").unwrap();
        // 1 fan + 3 terminate events
        assert_eq!(rec.results_total, 4);
        assert_eq!(rec.results_success, 4);
        assert_eq!(rec.progress, 1.0);
    }

    #[tokio::test]
    async fn test_worker_pool_drains_with_identical_counters() {
        let (dao, run_id) = started_run();
        let session = Uuid::new_v4();
        // 2 fan events x 3 children each, processed by 4 workers
        let seed = vec![
            Event::immediate("fan", serde_json::Value::Null, session),
            Event::immediate("fan", serde_json::Value::Null, session),
        ];
        let d = Dispatcher::new(
            seed,
            registry(),
            dao.clone(),
            run_id,
            4,
            CancellationToken::new(),
            Box::new(|done| done as f64 / 8.0),
        );
        assert_eq!(d.run().await, DispatchOutcome::Drained);
        let rec = dao.get_run("T1", "01").unwrap();
        assert_eq!(rec.results_total, 8);
        assert_eq!(rec.results_success, 8);
        assert_eq!(rec.progress, 1.0);
    }

    #[tokio::test]
    async fn test_producer_failure_is_recorded_not_fatal() {
        let (dao, run_id) = started_run();
        let session = Uuid::new_v4();
        let seed = vec![
            Event::immediate("bad", serde_json::Value::Null, session),
            Event::immediate("fan", serde_json::Value::Null, session),
        ];
        let d = Dispatcher::new(
            seed,
            registry(),
            dao.clone(),
            run_id,
            1,
            CancellationToken::new(),
            Box::new(|done| done as f64 / 5.0),
        );
        assert_eq!(d.run().await, DispatchOutcome::Drained);
        let rec = dao.get_run("T1", "01").unwrap();
        assert_eq!(rec.results_fail, 1);
        assert_eq!(rec.results_success, 4);
        assert_eq!(rec.results_total, 5);
    }

    #[tokio::test]
    async fn test_unroutable_event_fails_and_branch_drops() {
        let (dao, run_id) = started_run();
        let seed = vec![Event::immediate(
            "no.such.producer",
            serde_json::Value::Null,
            Uuid::new_v4(),
        )];
        let d = Dispatcher::new(
            seed,
            registry(),
            dao.clone(),
            run_id,
            1,
            CancellationToken::new(),
            Box::new(|_| 0.5),
        );
        assert_eq!(d.run().await, DispatchOutcome::Drained);
        assert_eq!(dao.get_run("T1", "01").unwrap().results_fail, 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_a_stuck_pipeline() {
        let (dao, run_id) = started_run();
        let cancel = CancellationToken::new();
        let seed = vec![Event::immediate(
            "stuck",
            serde_json::Value::Null,
            Uuid::new_v4(),
        )];
        let d = Dispatcher::new(
            seed,
            registry(),
            dao,
            run_id,
            1,
            cancel.clone(),
            Box::new(|_| 0.0),
        );
        let handle = tokio::spawn(d.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("dispatcher must stop promptly")
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_deferred_events_run_at_their_wake_time() {
        let (dao, run_id) = started_run();
        let session = Uuid::new_v4();
        let wake = now_millis() + 150;
        let seed = vec![Event::deferred(
            TERMINATE_EVENT,
            serde_json::Value::Null,
            wake,
            session,
        )];
        let d = Dispatcher::new(
            seed,
            registry(),
            dao.clone(),
            run_id,
            1,
            CancellationToken::new(),
            Box::new(|_| 1.0),
        );
        let begun = std::time::Instant::now();
        assert_eq!(d.run().await, DispatchOutcome::Drained);
        assert!(begun.elapsed() >= Duration::from_millis(100));
        assert_eq!(dao.get_run("T1", "01").unwrap().results_total, 1);
    }
}
