//! Run context -- the live execution environment for one active run.
//!
//! Owns exactly one dispatcher task and its event queue. The context is an
//! explicit resource handle: every exit path (natural drain, forced
//! terminate, controller shutdown) releases it by cancelling the dispatcher,
//! never by letting it fall out of scope silently.

use crate::event::dispatcher::{DispatchOutcome, Dispatcher, ProgressFn};
use crate::event::{Event, ProducerRegistry};
use crate::storage::Dao;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

/// Execution state of a run context. Terminal states mean the dispatcher has
/// exited and the context is ready to be destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Initializing,
    Running,
    Drained,
    Stopped,
    Failed,
}

impl ContextState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContextState::Drained | ContextState::Stopped | ContextState::Failed
        )
    }
}

pub struct RunContext {
    session: Uuid,
    run_id: i64,
    state_rx: watch::Receiver<ContextState>,
    cancel: CancellationToken,
}

impl RunContext {
    /// Build the context and spawn its dispatcher.
    pub fn spawn(
        dao: Dao,
        run_id: i64,
        session: Uuid,
        registry: ProducerRegistry,
        initial_events: Vec<Event>,
        concurrency: usize,
        progress: ProgressFn,
    ) -> RunContext {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ContextState::Initializing);

        let dispatcher = Dispatcher::new(
            initial_events,
            registry,
            dao,
            run_id,
            concurrency,
            cancel.clone(),
            progress,
        );
        tokio::spawn(async move {
            let _ = state_tx.send(ContextState::Running);
            match tokio::spawn(dispatcher.run()).await {
                Ok(DispatchOutcome::Drained) => {
                    debug!(run_id, "Run context drained");
                    let _ = state_tx.send(ContextState::Drained);
                }
                Ok(DispatchOutcome::Stopped) => {
                    debug!(run_id, "Run context stopped");
                    let _ = state_tx.send(ContextState::Stopped);
                }
                Err(e) => {
                    error!(run_id, "Run dispatcher aborted: {e}");
                    let _ = state_tx.send(ContextState::Failed);
                }
            }
        });

        RunContext {
            session,
            run_id,
            state_rx,
            cancel,
        }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn state(&self) -> ContextState {
        *self.state_rx.borrow()
    }

    /// Best-effort stop: the dispatcher stops pulling events immediately;
    /// in-flight processing may continue briefly but its output is discarded.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait until the dispatcher reaches a terminal state. Test hook.
    pub async fn wait_terminal(&self) {
        let mut rx = self.state_rx.clone();
        while !rx.borrow().is_terminal() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
