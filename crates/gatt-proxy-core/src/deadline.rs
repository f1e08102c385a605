//! Phase deadlines for the state machine actors

use std::time::Duration;
use tokio::time::Instant;

use crate::error::ProxyError;

/// A timer armed for one phase of a state machine
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    pub(crate) at: Instant,
    pub(crate) phase: &'static str,
    pub(crate) duration: Duration,
}

impl Deadline {
    pub(crate) fn after(phase: &'static str, duration: Duration) -> Self {
        Self {
            at: Instant::now() + duration,
            phase,
            duration,
        }
    }

    pub(crate) fn timeout_error(&self) -> ProxyError {
        ProxyError::Timeout {
            phase: self.phase,
            duration_ms: self.duration.as_millis() as u64,
        }
    }
}

/// Sleep until the deadline, or forever when none is armed
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
