//! Scheduler and job controller adapters for running the stage in a process.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::error;

use crate::error::PipelineError;
use crate::stage::{JobController, Scheduler};

/// A gate the record reader waits on while the stage is saturated.
#[derive(Debug)]
pub struct PauseGate {
    paused: watch::Sender<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Resolve once the gate is open.
    pub async fn wait_until_open(&self) {
        let mut receiver = self.paused.subscribe();
        if receiver.wait_for(|paused| !*paused).await.is_err() {
            error!("pause gate closed while waiting");
        }
    }
}

impl Scheduler for PauseGate {
    fn saturate(&self) {
        self.paused.send_replace(true);
    }

    fn drain(&self) {
        self.paused.send_replace(false);
    }
}

/// Keeps the fatal error the stage stopped with.
#[derive(Debug)]
pub struct JobHandle {
    error: watch::Sender<Option<Arc<str>>>,
}

impl Default for JobHandle {
    fn default() -> Self {
        let (error, _) = watch::channel(None);
        Self { error }
    }
}

impl JobHandle {
    pub fn error(&self) -> Option<Arc<str>> {
        self.error.borrow().clone()
    }

    /// Resolve once the job was stopped.
    pub async fn stopped(&self) -> Arc<str> {
        let mut receiver = self.error.subscribe();
        loop {
            let current = receiver.borrow_and_update().clone();
            if let Some(error) = current {
                return error;
            }
            if receiver.changed().await.is_err() {
                return Arc::from("job handle dropped");
            }
        }
    }
}

impl JobController for JobHandle {
    fn stop(&self, error: &PipelineError) {
        self.error.send_replace(Some(Arc::from(error.to_string())));
    }
}
