//! One inbound connection and its (at most one) outbound peer.

use crate::transport::Connection;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Progress of the session's single outbound connect attempt.
#[derive(Debug, Clone)]
pub(crate) enum OutboundState {
    Connecting,
    Connected(Arc<dyn Connection>),
    Failed,
}

impl OutboundState {
    fn is_settled(&self) -> bool {
        !matches!(self, OutboundState::Connecting)
    }
}

pub(crate) struct Session {
    pub id: String,
    pub inbound: Arc<dyn Connection>,
    /// `None` in mock mode
    outbound: Option<watch::Sender<OutboundState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(inbound: Arc<dyn Connection>, proxied: bool) -> Arc<Self> {
        let outbound = proxied.then(|| watch::channel(OutboundState::Connecting).0);
        Arc::new(Self {
            id: inbound.id().to_string(),
            inbound,
            outbound,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Wait for the in-flight connect attempt and return its connection.
    /// Every caller observes the same attempt.
    pub async fn outbound(&self) -> Option<Arc<dyn Connection>> {
        let mut rx = self.outbound.as_ref()?.subscribe();
        let state = rx.wait_for(OutboundState::is_settled).await.ok()?;
        match &*state {
            OutboundState::Connected(connection) => Some(Arc::clone(connection)),
            _ => None,
        }
    }

    /// Outbound connection if already established, without waiting.
    pub fn current_outbound(&self) -> Option<Arc<dyn Connection>> {
        match &*self.outbound.as_ref()?.borrow() {
            OutboundState::Connected(connection) => Some(Arc::clone(connection)),
            _ => None,
        }
    }

    pub fn set_outbound(&self, state: OutboundState) {
        if let Some(ref tx) = self.outbound {
            tx.send_replace(state);
        }
    }

    /// Resolve once the connect attempt succeeded or failed.
    pub async fn settled(&self) {
        if let Some(ref tx) = self.outbound {
            let mut rx = tx.subscribe();
            let _ = rx.wait_for(OutboundState::is_settled).await;
        }
    }

    pub fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnection;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waiters_share_one_attempt() {
        let ((inbound, _), (outbound, _)) = MemoryConnection::pair();
        let session = Session::new(inbound, true);
        assert!(session.current_outbound().is_none());

        let a = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.outbound().await })
        };
        let b = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.outbound().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.set_outbound(OutboundState::Connected(outbound.clone()));

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.id(), outbound.id());
        assert_eq!(b.id(), outbound.id());
        assert!(session.current_outbound().is_some());
    }

    #[tokio::test]
    async fn test_failed_attempt_resolves_to_none() {
        let ((inbound, _), _) = MemoryConnection::pair();
        let session = Session::new(inbound, true);
        session.set_outbound(OutboundState::Failed);
        session.settled().await;
        assert!(session.outbound().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_session_has_no_outbound() {
        let ((inbound, _), _) = MemoryConnection::pair();
        let session = Session::new(inbound, false);
        session.settled().await;
        assert!(session.outbound().await.is_none());
    }
}
