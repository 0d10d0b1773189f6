use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::TaskFailure;

/// Message delivered to a live instance task. Each carries the ack token of
/// the orchestrator-queue item it came from, so the item is acked only
/// after the instance has persisted it.
#[derive(Debug)]
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        failure: TaskFailure,
        ack_token: Option<String>,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
        ack_token: Option<String>,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
        ack_token: Option<String>,
    },
    TerminateRequested {
        instance: String,
        reason: String,
        ack_token: Option<String>,
    },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::ActivityFailed { instance, .. }
            | OrchestratorMsg::TimerFired { instance, .. }
            | OrchestratorMsg::ExternalRaised { instance, .. }
            | OrchestratorMsg::TerminateRequested { instance, .. } => instance,
        }
    }

    pub fn ack_token(&self) -> Option<&str> {
        match self {
            OrchestratorMsg::ActivityCompleted { ack_token, .. }
            | OrchestratorMsg::ActivityFailed { ack_token, .. }
            | OrchestratorMsg::TimerFired { ack_token, .. }
            | OrchestratorMsg::ExternalRaised { ack_token, .. }
            | OrchestratorMsg::TerminateRequested { ack_token, .. } => ack_token.as_deref(),
        }
    }
}

/// Per-instance inboxes for instances currently hydrated in this process.
#[derive(Default)]
pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    /// Hand a message to its instance. Gives the message back when no live
    /// inbox exists so the caller can rehydrate and redeliver.
    pub async fn try_deliver(&self, msg: OrchestratorMsg) -> Result<(), OrchestratorMsg> {
        let inboxes = self.inboxes.lock().await;
        match inboxes.get(msg.instance()) {
            Some(tx) => tx.send(msg).map_err(|e| {
                debug!(instance = %e.0.instance(), "inbox closed");
                e.0
            }),
            None => Err(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn undeliverable_message_is_returned() {
        let router = InstanceRouter::default();
        let msg = OrchestratorMsg::ExternalRaised {
            instance: "i1".into(),
            name: "Go".into(),
            data: "x".into(),
            ack_token: Some("t1".into()),
        };
        let back = router.try_deliver(msg).await.unwrap_err();
        assert_eq!(back.ack_token(), Some("t1"));

        let mut rx = router.register("i1").await;
        router.try_deliver(back).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().instance(), "i1");

        router.unregister("i1").await;
        let again = OrchestratorMsg::ExternalRaised {
            instance: "i1".into(),
            name: "Go".into(),
            data: "y".into(),
            ack_token: None,
        };
        assert!(router.try_deliver(again).await.is_err());
    }
}
