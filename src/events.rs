//! Kubernetes event emission (spec C7), grounded in the teacher's
//! `Diagnostics::recorder` (`Recorder::new(client, reporter, object_ref)`).

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};

use crate::api::ManagedCertificate;

pub const REPORTER: &str = "mcrt-controller";

/// Event emission surface the Synchronizer, SC Manager, and Binder depend
/// on (spec §4.7). A trait so tests substitute an in-memory fake instead of
/// touching a real API server's event sink.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn on_certificate(&self, mc: &ManagedCertificate, kind: EventType, reason: &str, note: String);
    async fn on_ingress(&self, ingress: &Ingress, kind: EventType, reason: &str, note: String);
}

pub struct KubeEventEmitter {
    client: Client,
    reporter: Reporter,
}

impl KubeEventEmitter {
    pub fn new(client: Client) -> Self {
        KubeEventEmitter {
            client,
            reporter: REPORTER.into(),
        }
    }
}

#[async_trait]
impl EventEmitter for KubeEventEmitter {
    async fn on_certificate(&self, mc: &ManagedCertificate, kind: EventType, reason: &str, note: String) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), mc.object_ref(&()));
        if let Err(e) = recorder
            .publish(Event {
                type_: kind,
                reason: reason.into(),
                note: Some(note),
                action: reason.into(),
                secondary: None,
            })
            .await
        {
            tracing::warn!(mc = %mc.name_any(), error = %e, "failed to publish event");
        }
    }

    async fn on_ingress(&self, ingress: &Ingress, kind: EventType, reason: &str, note: String) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), ingress.object_ref(&()));
        if let Err(e) = recorder
            .publish(Event {
                type_: kind,
                reason: reason.into(),
                note: Some(note),
                action: reason.into(),
                secondary: None,
            })
            .await
        {
            tracing::warn!(ingress = %ingress.name_any(), error = %e, "failed to publish event");
        }
    }
}

/// Convenience constructors matching the event kinds named in spec §4.4/§4.6.
pub mod reasons {
    pub const CREATE: &str = "Create";
    pub const DELETE: &str = "Delete";
    pub const BACKEND_ERROR: &str = "BackendError";
    pub const TOO_MANY_CERTIFICATES: &str = "TooManyCertificates";
    pub const MISSING_CERTIFICATE: &str = "MissingCertificate";
}

#[cfg(test)]
pub struct FakeEventEmitter {
    pub certificate_events: tokio::sync::RwLock<Vec<(String, String, String)>>,
    pub ingress_events: tokio::sync::RwLock<Vec<(String, String, String)>>,
}

#[cfg(test)]
impl FakeEventEmitter {
    pub fn new() -> Self {
        FakeEventEmitter {
            certificate_events: tokio::sync::RwLock::new(Vec::new()),
            ingress_events: tokio::sync::RwLock::new(Vec::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl EventEmitter for FakeEventEmitter {
    async fn on_certificate(&self, mc: &ManagedCertificate, _kind: EventType, reason: &str, note: String) {
        self.certificate_events
            .write()
            .await
            .push((mc.name_any(), reason.to_string(), note));
    }

    async fn on_ingress(&self, ingress: &Ingress, _kind: EventType, reason: &str, note: String) {
        self.ingress_events
            .write()
            .await
            .push((ingress.name_any(), reason.to_string(), note));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ManagedCertificateSpec;

    #[tokio::test]
    async fn fake_emitter_records_certificate_events() {
        let emitter = FakeEventEmitter::new();
        let mc = ManagedCertificate::new(
            "foo",
            ManagedCertificateSpec {
                domains: vec!["a.example".into()],
            },
        );
        emitter
            .on_certificate(&mc, EventType::Warning, reasons::BACKEND_ERROR, "boom".into())
            .await;
        let events = emitter.certificate_events.read().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, reasons::BACKEND_ERROR);
    }
}
