//! Kubernetes Event recording for the LoadBalancer controller.
//!
//! Events are fire-and-forget: failures are logged and never propagate.
//! A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about a resource
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), resource_ref.clone());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Drops every event; used in standalone mode.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// A reconcile step failed; the note carries the error
    pub const RECONCILE_ERROR: &str = "ReconcileError";
    pub const INVALID_SOURCE_RANGE: &str = "InvalidSourceRange";
    pub const SECURITY_GROUP_CREATED: &str = "SecurityGroupCreated";
    pub const FLOATING_IP_CREATED: &str = "FloatingIPCreated";
    pub const PORT_CREATED: &str = "PortCreated";
    /// A resource named like ours already existed and was taken over
    pub const ADOPTED: &str = "Adopted";
    pub const FLOATING_IP_BOUND: &str = "FloatingIPBound";
    pub const REVISION_CREATED: &str = "RevisionCreated";
    pub const SCALED_DOWN: &str = "ScaledDown";
    pub const DELETING_SETS: &str = "DeletingSets";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const CREATE: &str = "Create";
    pub const BIND: &str = "Bind";
    pub const SCALE: &str = "Scale";
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedEvent {
        pub warning: bool,
        pub reason: String,
        pub note: Option<String>,
    }

    /// Keeps every published event in memory
    #[derive(Default)]
    pub struct RecordingEventPublisher {
        events: Mutex<Vec<RecordedEvent>>,
    }

    impl RecordingEventPublisher {
        pub fn events(&self) -> Vec<RecordedEvent> {
            self.events.lock().clone()
        }

        pub fn warnings(&self) -> Vec<RecordedEvent> {
            self.events().into_iter().filter(|e| e.warning).collect()
        }

        pub fn count_reason(&self, reason: &str) -> usize {
            self.events.lock().iter().filter(|e| e.reason == reason).count()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingEventPublisher {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            _action: &str,
            note: Option<String>,
        ) {
            self.events.lock().push(RecordedEvent {
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                note,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::recording::RecordingEventPublisher;
    use super::*;

    #[test]
    fn test_publishers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<KubeEventPublisher>();
    }

    #[tokio::test]
    async fn test_recording_publisher() {
        let publisher = RecordingEventPublisher::default();
        let obj_ref = ObjectReference::default();
        publisher
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::RECONCILE_ERROR,
                actions::RECONCILE,
                Some("boom".to_string()),
            )
            .await;
        NoopEventPublisher
            .publish(&obj_ref, EventType::Normal, reasons::ADOPTED, actions::CREATE, None)
            .await;

        assert_eq!(publisher.warnings().len(), 1);
        assert_eq!(publisher.count_reason(reasons::RECONCILE_ERROR), 1);
        assert_eq!(publisher.events()[0].note.as_deref(), Some("boom"));
    }
}
