use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub object: &'static str,
    pub project: String,
    pub actor: String,
}

/// Fan-out of record changes to live subscribers. Delivery is best effort.
pub trait ChangeNotifier: Send + Sync {
    fn project_updated(&self, project: &str, actor: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl ChangeNotifier for TracingNotifier {
    fn project_updated(&self, project: &str, actor: &str) {
        tracing::info!(target: "waypost.invites", project, actor, "project updated");
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<ChangeEvent>,
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

impl ChangeNotifier for BroadcastNotifier {
    fn project_updated(&self, project: &str, actor: &str) {
        let event = ChangeEvent {
            object: "project",
            project: project.to_string(),
            actor: actor.to_string(),
        };
        match self.sender.send(event) {
            Ok(receivers) => {
                tracing::debug!(target: "waypost.invites", project, receivers, "project update broadcast");
            }
            Err(_) => {
                tracing::debug!(target: "waypost.invites", project, "project update had no subscribers");
            }
        }
    }
}
