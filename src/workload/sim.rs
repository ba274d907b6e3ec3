//! Built-in simulated workload.
//!
//! One `sim.seed` event fans out `process.count` `sim.process` events,
//! staggered by `process.delay.ms`; each process event performs a unit of
//! simulated work and produces nothing, so the pipeline drains once the last
//! one finishes.

use crate::error::{AppError, AppResult};
use crate::event::{Event, EventProducer, ProducerRegistry, TerminateProducer, TERMINATE_EVENT};
use crate::model::now_millis;
use crate::workload::Workload;
use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const EVENT_SEED: &str = "sim.seed";
pub const EVENT_PROCESS: &str = "sim.process";

pub const PROP_PROCESS_COUNT: &str = "process.count";
pub const PROP_PROCESS_DELAY_MS: &str = "process.delay.ms";
pub const PROP_FAIL_RATIO: &str = "process.fail.ratio";
pub const PROP_DATASTORE_HOST: &str = "datastore.host";

const DEPENDENCY_TIMEOUT: Duration = Duration::from_secs(2);

fn prop_u64(props: &HashMap<String, String>, key: &str, fallback: u64) -> u64 {
    props.get(key).and_then(|v| v.parse().ok()).unwrap_or(fallback)
}

fn prop_f64(props: &HashMap<String, String>, key: &str, fallback: f64) -> f64 {
    props.get(key).and_then(|v| v.parse().ok()).unwrap_or(fallback)
}

pub struct SimWorkload;

#[async_trait]
impl Workload for SimWorkload {
    fn name(&self) -> &str {
        "sim"
    }

    fn registry(&self) -> ProducerRegistry {
        let mut registry = ProducerRegistry::new();
        registry.register(EVENT_SEED, Arc::new(SeedProducer));
        registry.register(EVENT_PROCESS, Arc::new(ProcessProducer));
        registry.register(TERMINATE_EVENT, Arc::new(TerminateProducer));
        registry
    }

    fn initial_events(&self, session: Uuid, props: &HashMap<String, String>) -> Vec<Event> {
        let payload = json!({
            "count": prop_u64(props, PROP_PROCESS_COUNT, 200),
            "delay_ms": prop_u64(props, PROP_PROCESS_DELAY_MS, 0),
            "fail_ratio": prop_f64(props, PROP_FAIL_RATIO, 0.0),
        });
        vec![Event::immediate(EVENT_SEED, payload, session)]
    }

    fn planned_units(&self, props: &HashMap<String, String>) -> u64 {
        // The seed event itself counts as one unit
        prop_u64(props, PROP_PROCESS_COUNT, 200) + 1
    }

    async fn check_dependencies(&self, props: &HashMap<String, String>) -> AppResult<()> {
        let host = props
            .get(PROP_DATASTORE_HOST)
            .cloned()
            .unwrap_or_default();
        let resolved =
            tokio::time::timeout(DEPENDENCY_TIMEOUT, tokio::net::lookup_host(host.clone())).await;
        if let Ok(Ok(mut addrs)) = resolved {
            if addrs.next().is_some() {
                return Ok(());
            }
        }
        Err(AppError::DependencyUnavailable(format!(
            "run datastore host '{}' cannot be resolved",
            host
        )))
    }
}

/// Fans one seed event out into the planned process events.
struct SeedProducer;

#[async_trait]
impl EventProducer for SeedProducer {
    async fn produce(&self, event: &Event) -> anyhow::Result<Vec<Event>> {
        let count = event.payload["count"].as_u64().unwrap_or(200);
        let delay_ms = event.payload["delay_ms"].as_u64().unwrap_or(0);
        let fail_ratio = event.payload["fail_ratio"].as_f64().unwrap_or(0.0);
        let now = now_millis();
        let events = (0..count)
            .map(|i| {
                // Both factors are user-supplied; a wrapped stagger would put
                // the wake time in the past
                let stagger = i.saturating_mul(delay_ms).min(i64::MAX as u64) as i64;
                Event::deferred(
                    EVENT_PROCESS,
                    json!({ "index": i, "fail_ratio": fail_ratio }),
                    now.saturating_add(stagger),
                    event.session,
                )
            })
            .collect();
        Ok(events)
    }
}

/// One unit of simulated work; terminal for its branch.
struct ProcessProducer;

#[async_trait]
impl EventProducer for ProcessProducer {
    async fn produce(&self, event: &Event) -> anyhow::Result<Vec<Event>> {
        let fail_ratio = event.payload["fail_ratio"].as_f64().unwrap_or(0.0);
        if fail_ratio > 0.0 && rand::thread_rng().gen::<f64>() < fail_ratio {
            anyhow::bail!(
                "simulated process {} failed",
                event.payload["index"].as_u64().unwrap_or(0)
            );
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(count: &str) -> HashMap<String, String> {
        let mut p = HashMap::new();
        p.insert(PROP_PROCESS_COUNT.to_string(), count.to_string());
        p.insert(PROP_PROCESS_DELAY_MS.to_string(), "0".to_string());
        p
    }

    #[tokio::test]
    async fn test_seed_fans_out_the_configured_count() {
        let wl = SimWorkload;
        let session = Uuid::new_v4();
        let seed = wl.initial_events(session, &props("5"));
        assert_eq!(seed.len(), 1);

        let out = SeedProducer.produce(&seed[0]).await.unwrap();
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|e| e.name == EVENT_PROCESS));
        assert_eq!(wl.planned_units(&props("5")), 6);
    }

    #[tokio::test]
    async fn test_extreme_delay_never_wraps_into_the_past() {
        let ev = Event::immediate(
            EVENT_SEED,
            json!({ "count": 3, "delay_ms": u64::MAX, "fail_ratio": 0.0 }),
            Uuid::new_v4(),
        );
        let now = now_millis();
        let out = SeedProducer.produce(&ev).await.unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|e| e.wake_at >= now));
    }

    #[tokio::test]
    async fn test_process_event_is_terminal() {
        let ev = Event::immediate(
            EVENT_PROCESS,
            json!({ "index": 0, "fail_ratio": 0.0 }),
            Uuid::new_v4(),
        );
        assert!(ProcessProducer.produce(&ev).await.unwrap().is_empty());
    }

    #[test]
    fn test_progress_stays_in_bounds() {
        let wl = SimWorkload;
        assert_eq!(wl.progress(0, 10), 0.0);
        assert_eq!(wl.progress(5, 10), 0.5);
        assert_eq!(wl.progress(20, 10), 1.0);
        assert_eq!(wl.progress(3, 0), 0.0);
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_dependency_unavailable() {
        let wl = SimWorkload;
        let mut p = HashMap::new();
        p.insert(PROP_DATASTORE_HOST.to_string(), "not a host".to_string());
        let err = wl.check_dependencies(&p).await.unwrap_err();
        assert!(matches!(err, AppError::DependencyUnavailable(_)));
        assert!(err.to_string().contains("not a host"));
    }

    #[tokio::test]
    async fn test_ip_literal_host_resolves() {
        let wl = SimWorkload;
        let mut p = HashMap::new();
        p.insert(PROP_DATASTORE_HOST.to_string(), "127.0.0.1:9301".to_string());
        wl.check_dependencies(&p).await.unwrap();
    }
}
