use std::time::Duration;

use uuid::Uuid;

use crate::worker::Worker;

/// Outcome of one session probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Alive,
    /// The worker answered with a different session id.
    Restarted(Uuid),
    Unreachable(String),
}

impl Health {
    pub fn is_alive(&self) -> bool {
        matches!(self, Health::Alive)
    }
}

/// Probe a worker's session, bounded by `timeout`.
pub async fn probe(worker: &dyn Worker, expected: Uuid, timeout: Duration) -> Health {
    match tokio::time::timeout(timeout, worker.session()).await {
        Ok(Ok(session)) if session == expected => Health::Alive,
        Ok(Ok(session)) => Health::Restarted(session),
        Ok(Err(e)) => Health::Unreachable(e.to_string()),
        Err(_) => Health::Unreachable(format!("no answer within {}ms", timeout.as_millis())),
    }
}
