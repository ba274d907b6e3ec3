//! Test run lifecycle controller -- the polling monitor.
//!
//! Reconciles declared schedule state against the set of live run contexts:
//! promotes due SCHEDULED runs, reaps drained contexts, and tears everything
//! down on shutdown. Reconciliation and all administrative mutations that
//! touch context creation/destruction serialize through one mutex.

pub mod context;

use crate::error::{AppError, AppResult};
use crate::model::{now_millis, RunRecord, RunState};
use crate::props::PropertyStore;
use crate::storage::Dao;
use crate::workload::Workload;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use context::{ContextState, RunContext};

pub struct Monitor {
    dao: Dao,
    props: PropertyStore,
    workload: Arc<dyn Workload>,
    concurrency: usize,
    /// Live contexts keyed by run record id. The lock doubles as the
    /// reconciliation guard: only one poll (or poll-serialized admin
    /// mutation) runs at a time.
    contexts: Mutex<HashMap<i64, Arc<RunContext>>>,
    shutdown: CancellationToken,
}

impl Monitor {
    pub fn new(
        dao: Dao,
        props: PropertyStore,
        workload: Arc<dyn Workload>,
        concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            dao,
            props,
            workload,
            concurrency,
            contexts: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// One reconciliation pass. The critical section covers state inspection
    /// and context construction/teardown only; dependency checks (network
    /// I/O, up to 2s per broken host) run with the lock released so
    /// administrative calls never queue behind them.
    pub async fn poll(&self) -> AppResult<()> {
        let now = now_millis();

        // Phase 1, under the lock: reap finished contexts, tear down stale
        // ones, and collect the runs that need a dependency check.
        let pending: Vec<RunRecord> = {
            let mut contexts = self.contexts.lock().await;
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            let mut live: HashSet<i64> = HashSet::new();
            let mut pending = Vec::new();

            for run in self.dao.list_active_runs()? {
                match run.state() {
                    RunState::Scheduled if run.scheduled <= now => {
                        if contexts.contains_key(&run.id) {
                            // Timestamp write raced ahead of a previous pass
                            live.insert(run.id);
                        } else {
                            pending.push(run);
                        }
                    }
                    RunState::Scheduled => {
                        // Not due yet
                    }
                    RunState::Started => match contexts.get(&run.id).cloned() {
                        Some(ctx) => match ctx.state() {
                            ContextState::Drained => {
                                self.dao.mark_completed(run.id, now)?;
                                ctx.stop();
                                contexts.remove(&run.id);
                                info!(test = %run.test, run = %run.name, "Run completed");
                            }
                            ContextState::Failed => {
                                self.dao.mark_stopped(run.id, now)?;
                                ctx.stop();
                                contexts.remove(&run.id);
                                warn!(test = %run.test, run = %run.name, "Run dispatcher failed; run stopped");
                            }
                            _ => {
                                live.insert(run.id);
                            }
                        },
                        None => {
                            // Process restart: record says STARTED but no
                            // context exists. Reattach rather than corrupt
                            // the record.
                            pending.push(run);
                        }
                    },
                    _ => {}
                }
            }

            // Drop contexts whose records left STARTED behind our back (e.g.
            // an offline administrative stop on the shared store)
            contexts.retain(|run_id, ctx| {
                if live.contains(run_id) {
                    true
                } else {
                    ctx.stop();
                    false
                }
            });

            pending
        };

        // Phase 2, lock released: dependency checks.
        let mut ready = Vec::new();
        for run in pending {
            let props = self.props.resolved(run.test_id, run.id)?;
            match self.workload.check_dependencies(&props).await {
                Ok(()) => ready.push((run, props)),
                Err(AppError::DependencyUnavailable(msg)) => {
                    // Leave the record SCHEDULED; retry next poll
                    error!(test = %run.test, run = %run.name, "Cannot activate run: {msg}");
                }
                Err(e) => {
                    error!(test = %run.test, run = %run.name, "Run activation failed: {e:#}");
                }
            }
        }
        if ready.is_empty() {
            return Ok(());
        }

        // Phase 3, under the lock again: promote. The guarded timestamp
        // UPDATE (and a fresh record read for reattachments) discards any run
        // that changed state while the lock was released.
        let mut contexts = self.contexts.lock().await;
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        for (run, props) in ready {
            if contexts.contains_key(&run.id) {
                continue;
            }
            match run.state() {
                RunState::Scheduled => {
                    if self.dao.mark_started(run.id, now_millis())? {
                        let ctx = self.build_context(&run, &props)?;
                        info!(test = %run.test, run = %run.name, "Run started");
                        contexts.insert(run.id, ctx);
                    }
                }
                RunState::Started => {
                    let current = match self.dao.get_run_by_id(run.id) {
                        Ok(rec) => rec,
                        Err(AppError::NotFound(_)) => continue,
                        Err(e) => return Err(e),
                    };
                    if current.state() == RunState::Started {
                        let ctx = self.build_context(&run, &props)?;
                        warn!(test = %run.test, run = %run.name, "Reattached orphaned run");
                        contexts.insert(run.id, ctx);
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Synchronous poll for deterministic tests and immediate reaction to
    /// administrative actions.
    pub async fn force_poke(&self) -> AppResult<()> {
        self.poll().await
    }

    /// Stop a live run. Only valid while STARTED; terminal runs conflict and
    /// nothing is mutated.
    pub async fn terminate(&self, test: &str, run: &str) -> AppResult<RunRecord> {
        let mut contexts = self.contexts.lock().await;
        let rec = self.dao.get_run(test, run)?;
        match rec.state() {
            RunState::Started => {}
            state => {
                return Err(AppError::Conflict(format!(
                    "run '{}.{}' is {} and cannot be terminated",
                    test, run, state
                )))
            }
        }
        self.dao.mark_stopped(rec.id, now_millis())?;
        if let Some(ctx) = contexts.remove(&rec.id) {
            ctx.stop();
        }
        info!(test = %test, run = %run, "Run terminated");
        self.dao.get_run(test, run)
    }

    /// Authoritative liveness signal: the live context for a STARTED run, or
    /// None. Callers must never infer liveness from record timestamps alone.
    pub async fn run_context(&self, test: &str, run: &str) -> AppResult<Option<Arc<RunContext>>> {
        let contexts = self.contexts.lock().await;
        let rec = self.dao.get_run(test, run)?;
        Ok(contexts.get(&rec.id).cloned())
    }

    /// Stop the periodic loop and destroy all live contexts. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut contexts = self.contexts.lock().await;
        for (_, ctx) in contexts.drain() {
            ctx.stop();
        }
        info!("Run monitor shut down");
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn build_context(
        &self,
        run: &RunRecord,
        props: &HashMap<String, String>,
    ) -> AppResult<Arc<RunContext>> {
        let session = uuid::Uuid::new_v4();
        let initial = self.workload.initial_events(session, props);
        let planned = self.workload.planned_units(props);
        let workload = Arc::clone(&self.workload);
        let progress = Box::new(move |done: u64| workload.progress(done, planned));
        Ok(Arc::new(RunContext::spawn(
            self.dao.clone(),
            run.id,
            session,
            self.workload.registry(),
            initial,
            self.concurrency,
            progress,
        )))
    }
}

/// Periodic reconciliation loop. Runs until the monitor is shut down.
pub async fn run_monitor_loop(monitor: Arc<Monitor>, period: Duration) {
    info!("Run monitor started");
    let shutdown = monitor.shutdown_token();
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = monitor.poll().await {
                    error!("Reconciliation pass failed: {e:#}");
                }
            }
            _ = shutdown.cancelled() => {
                info!("Run monitor loop stopped");
                break;
            }
        }
    }
}
