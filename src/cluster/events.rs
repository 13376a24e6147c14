/// Lifecycle transition events emitted during cluster creation
use tracing::{info, warn};

use super::create::CreateStage;

/// Discrete lifecycle transition of a creation attempt
///
/// The core emits these; rendering them is the presentation layer's job.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    StageStarted { cluster: String, stage: CreateStage },
    StageFailed { cluster: String, stage: CreateStage },
    RollbackStarted { cluster: String },
}

/// Receiver for lifecycle events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ClusterEvent);
}

/// Default sink that forwards events to the tracing subscriber
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::StageStarted { cluster, stage } => {
                info!("[{}] {}", cluster, stage);
            }
            ClusterEvent::StageFailed { cluster, stage } => {
                warn!("[{}] {} failed", cluster, stage);
            }
            ClusterEvent::RollbackStarted { cluster } => {
                warn!("[{}] rolling back partially created nodes", cluster);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records events for assertions
    pub struct RecordingSink(pub Mutex<Vec<ClusterEvent>>);

    impl EventSink for RecordingSink {
        fn emit(&self, event: &ClusterEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_recording_sink_collects_in_order() {
        let sink = RecordingSink(Mutex::new(Vec::new()));
        sink.emit(&ClusterEvent::StageStarted {
            cluster: "dev".to_string(),
            stage: CreateStage::Provisioning,
        });
        sink.emit(&ClusterEvent::RollbackStarted {
            cluster: "dev".to_string(),
        });

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ClusterEvent::StageStarted { .. }));
        assert!(matches!(events[1], ClusterEvent::RollbackStarted { .. }));
    }
}
