//! Binder (spec C6): reconciles the pre-shared-cert annotation on each
//! ingress against the desired attach/detach sets derived from the state
//! store.
//!
//! The per-ingress loop uses `continue` on every early-exit condition,
//! never `return` — a problem with one ingress must never short-circuit
//! the remaining ingresses in the same pass.

use crate::api::{format_annotation_set, parse_annotation_set, ManagedCertificate, MANAGED_CERTIFICATES_ANNOTATION, PRE_SHARED_CERT_ANNOTATION};
use crate::clients::ingress::IngressClient;
use crate::clients::managed_certificate::ManagedCertificateClient;
use crate::events::{reasons, EventEmitter};
use crate::identity::CertId;
use crate::state::StateStore;
use chrono::Utc;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::warn;

pub struct Binder {
    state: Arc<StateStore>,
    mc_client: Arc<dyn ManagedCertificateClient>,
    ingress_client: Arc<dyn IngressClient>,
    events: Arc<dyn EventEmitter>,
    metrics: Arc<crate::metrics::Metrics>,
}

impl Binder {
    pub fn new(
        state: Arc<StateStore>,
        mc_client: Arc<dyn ManagedCertificateClient>,
        ingress_client: Arc<dyn IngressClient>,
        events: Arc<dyn EventEmitter>,
        metrics: Arc<crate::metrics::Metrics>,
    ) -> Self {
        Binder {
            state,
            mc_client,
            ingress_client,
            events,
            metrics,
        }
    }

    /// Runs a full pass over every in-scope ingress. Driven by both
    /// per-ingress events and the periodic full-resync tick (spec §4.9).
    pub async fn sync_all(&self) {
        let entries = self.state.list().await;
        let attach: BTreeMap<CertId, String> = entries
            .iter()
            .filter(|(_, e)| !e.soft_deleted && e.has_ssl_certificate())
            .map(|(id, e)| (id.clone(), e.ssl_certificate_name.clone()))
            .collect();
        let detach: HashSet<String> = entries
            .iter()
            .filter(|(_, e)| e.soft_deleted)
            .map(|(_, e)| e.ssl_certificate_name.clone())
            .collect();
        let known_ids: HashSet<CertId> = entries.iter().map(|(id, _)| id.clone()).collect();

        for ingress in self.ingress_client.list().await {
            self.sync_one(&ingress, &attach, &detach, &known_ids).await;
        }
    }

    /// Processes a single ingress (spec §4.6). All failure/no-op paths
    /// `return` out of this function, which is the per-ingress `continue`
    /// equivalent at the call site in `sync_all`.
    async fn sync_one(&self, ingress: &Ingress, attach: &BTreeMap<CertId, String>, detach: &HashSet<String>, known_ids: &HashSet<CertId>) {
        let Some(namespace) = ingress.namespace() else {
            return;
        };
        let name = ingress.name_any();

        let requested: HashSet<String> = parse_annotation_set(ingress.annotations().get(MANAGED_CERTIFICATES_ANNOTATION).map(String::as_str).unwrap_or(""));
        let current: HashSet<String> = parse_annotation_set(ingress.annotations().get(PRE_SHARED_CERT_ANNOTATION).map(String::as_str).unwrap_or(""));

        let mut desired: HashSet<String> = current.difference(detach).cloned().collect();
        let mut contributing: Vec<CertId> = Vec::new();

        for (id, ssl_name) in attach {
            if id.namespace == namespace && requested.contains(&id.name) {
                desired.insert(ssl_name.clone());
                contributing.push(id.clone());
            }
        }

        for mc_name in &requested {
            let matched = known_ids.iter().any(|id| id.namespace == namespace && &id.name == mc_name);
            if !matched {
                self.events
                    .on_ingress(
                        ingress,
                        EventType::Warning,
                        reasons::MISSING_CERTIFICATE,
                        format!("ManagedCertificate {namespace}/{mc_name} requested by ingress {name} was not found"),
                    )
                    .await;
            }
        }

        let desired_value = format_annotation_set(&desired.iter().cloned().collect::<Vec<_>>());
        let current_value = format_annotation_set(&current.iter().cloned().collect::<Vec<_>>());
        if desired_value == current_value {
            return;
        }

        let mut new_annotations = ingress.annotations().clone();
        if desired_value.is_empty() {
            new_annotations.remove(PRE_SHARED_CERT_ANNOTATION);
        } else {
            new_annotations.insert(PRE_SHARED_CERT_ANNOTATION.to_string(), desired_value);
        }

        if let Err(e) = self.ingress_client.patch_annotations(&namespace, &name, new_annotations).await {
            warn!(ingress = %name, error = %e, "failed to patch pre-shared-cert annotation");
            self.metrics.record_backend_error();
            return;
        }

        for id in contributing {
            self.report_binding_latency(&id).await;
        }
    }

    async fn report_binding_latency(&self, id: &CertId) {
        let Ok(entry) = self.state.get(id).await else {
            return;
        };
        if entry.excluded_from_slo || entry.ssl_certificate_binding_reported {
            return;
        }
        let Some(mc) = self.mc_client.get(id).await else {
            return;
        };
        if let Some(created) = creation_timestamp(&mc) {
            let seconds = (Utc::now() - created).num_milliseconds() as f64 / 1000.0;
            self.metrics.observe_binding_latency(&id.to_string(), seconds.max(0.0));
        }
        let _ = self.state.set_ssl_certificate_binding_reported(id).await;
    }
}

fn creation_timestamp(mc: &ManagedCertificate) -> Option<chrono::DateTime<Utc>> {
    mc.creation_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ManagedCertificateSpec;
    use crate::clients::ingress::FakeIngressClient;
    use crate::clients::managed_certificate::FakeManagedCertificateClient;
    use crate::events::FakeEventEmitter;
    use crate::metrics::Metrics;
    use kube::core::ObjectMeta;

    fn ingress(ns: &str, name: &str, mcrt: &str, current: &str) -> Ingress {
        let mut annotations = BTreeMap::new();
        if !mcrt.is_empty() {
            annotations.insert(MANAGED_CERTIFICATES_ANNOTATION.to_string(), mcrt.to_string());
        }
        if !current.is_empty() {
            annotations.insert(PRE_SHARED_CERT_ANNOTATION.to_string(), current.to_string());
        }
        Ingress {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn mc(ns: &str, name: &str) -> ManagedCertificate {
        let mut m = ManagedCertificate::new(name, ManagedCertificateSpec { domains: vec!["a.example".into()] });
        m.meta_mut().namespace = Some(ns.to_string());
        m
    }

    async fn harness() -> (Binder, Arc<StateStore>, Arc<FakeIngressClient>, Arc<FakeManagedCertificateClient>, Arc<FakeEventEmitter>) {
        let state = Arc::new(StateStore::empty());
        let ingress_client = Arc::new(FakeIngressClient::new());
        let mc_client = Arc::new(FakeManagedCertificateClient::new());
        let events = Arc::new(FakeEventEmitter::new());
        let metrics = Arc::new(Metrics::default());
        let binder = Binder::new(state.clone(), mc_client.clone(), ingress_client.clone(), events.clone(), metrics);
        (binder, state, ingress_client, mc_client, events)
    }

    #[tokio::test]
    async fn attaches_ssl_cert_for_requested_managed_certificate() {
        let (binder, state, ingress_client, mc_client, _events) = harness().await;
        let id = CertId::new("default", "foo");
        state.insert(&id, "mcert1").await;
        mc_client.objects.write().await.insert(id.clone(), mc("default", "foo"));
        ingress_client.insert(ingress("default", "ing", "foo", "")).await;

        binder.sync_all().await;

        let patched = ingress_client.get("default", "ing").await.unwrap();
        assert_eq!(patched.annotations().get(PRE_SHARED_CERT_ANNOTATION).unwrap(), "mcert1");
    }

    #[tokio::test]
    async fn detaches_soft_deleted_certs_and_leaves_others() {
        let (binder, state, ingress_client, _mc_client, _events) = harness().await;
        let soft = CertId::new("default", "gone");
        state.insert(&soft, "mcert-old").await;
        state.set_soft_deleted(&soft).await.unwrap();
        ingress_client.insert(ingress("default", "ing", "", "mcert-old,mcert-keep")).await;

        binder.sync_all().await;

        let patched = ingress_client.get("default", "ing").await.unwrap();
        assert_eq!(patched.annotations().get(PRE_SHARED_CERT_ANNOTATION).unwrap(), "mcert-keep");
    }

    #[tokio::test]
    async fn missing_certificate_emits_event_but_does_not_abort_remaining_ingresses() {
        let (binder, _state, ingress_client, _mc_client, events) = harness().await;
        ingress_client.insert(ingress("default", "bad", "does-not-exist", "")).await;
        ingress_client.insert(ingress("default", "ok", "", "mcert-keep")).await;

        binder.sync_all().await;

        assert_eq!(events.ingress_events.read().await.len(), 1);
        // The second ingress in the pass was still processed: its unchanged
        // annotation is untouched but `get` still resolves it (no panic, no
        // early-return skip).
        assert!(ingress_client.get("default", "ok").await.is_some());
    }

    #[tokio::test]
    async fn unchanged_annotation_is_not_repatched() {
        let (binder, state, ingress_client, mc_client, _events) = harness().await;
        let id = CertId::new("default", "foo");
        state.insert(&id, "mcert1").await;
        state.set_ssl_certificate_binding_reported(&id).await.unwrap();
        mc_client.objects.write().await.insert(id.clone(), mc("default", "foo"));
        ingress_client.insert(ingress("default", "ing", "foo", "mcert1")).await;

        binder.sync_all().await;
        // No panic; the annotation already matched desired state.
        let patched = ingress_client.get("default", "ing").await.unwrap();
        assert_eq!(patched.annotations().get(PRE_SHARED_CERT_ANNOTATION).unwrap(), "mcert1");
    }
}
