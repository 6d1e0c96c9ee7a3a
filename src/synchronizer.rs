//! Synchronizer (spec C5): the per-MC reconcile step. This is the heart of
//! the controller — it drives a ManagedCertificate's state entry and its
//! cloud SslCertificate toward agreement, and runs the soft-delete lifecycle
//! once the MC itself is gone from the cluster.

use crate::api::{domains_equal, DomainStatus, ManagedCertificate, ManagedCertificateStatus};
use crate::clients::ingress::IngressClient;
use crate::clients::managed_certificate::ManagedCertificateClient;
use crate::errors::{Error, StdError};
use crate::identity::{random_ssl_certificate_name, CertId};
use crate::ssl_manager::SslManager;
use crate::state::StateStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// What the caller (the orchestrator's worker loop) should do after a
/// `sync` call returns `Ok`. Most passes are simply done; the domain-change
/// re-provision path (spec §4.5 step 4) needs the key reprocessed right
/// away rather than waiting for the rate limiter's next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Done,
    RequeueImmediately,
}

pub struct Synchronizer {
    state: Arc<StateStore>,
    mc_client: Arc<dyn ManagedCertificateClient>,
    ingress_client: Arc<dyn IngressClient>,
    ssl: Arc<SslManager>,
    metrics: Arc<crate::metrics::Metrics>,
}

impl Synchronizer {
    pub fn new(
        state: Arc<StateStore>,
        mc_client: Arc<dyn ManagedCertificateClient>,
        ingress_client: Arc<dyn IngressClient>,
        ssl: Arc<SslManager>,
        metrics: Arc<crate::metrics::Metrics>,
    ) -> Self {
        Synchronizer {
            state,
            mc_client,
            ingress_client,
            ssl,
            metrics,
        }
    }

    pub async fn sync(&self, id: &CertId) -> Result<SyncOutcome, Error> {
        let _measurer = self.metrics.count_and_measure(&id.to_string());
        let result = self.sync_inner(id).await;
        if let Err(e) = &result {
            self.metrics.reconcile_failure(&id.to_string(), e);
        }
        result
    }

    async fn sync_inner(&self, id: &CertId) -> Result<SyncOutcome, Error> {
        self.state.ensure_exists(id).await;
        let entry = self.state.get(id).await.map_err(|e| Error::StdError(StdError::Internal(e.to_string())))?;

        let mc = self.mc_client.get(id).await;

        let mc = match mc {
            None if entry.has_ssl_certificate() => {
                if !entry.soft_deleted {
                    self.state.set_soft_deleted(id).await.map_err(|e| Error::StdError(StdError::Internal(e.to_string())))?;
                }
                return self.soft_delete(id, None).await;
            }
            None => {
                self.state.delete(id).await;
                return Ok(SyncOutcome::Done);
            }
            Some(mc) => mc,
        };

        if entry.soft_deleted {
            return self.soft_delete(id, Some(&mc)).await;
        }

        let ssl_name = if entry.has_ssl_certificate() {
            entry.ssl_certificate_name.clone()
        } else {
            let name = random_ssl_certificate_name();
            self.state.insert(id, &name).await;
            name
        };

        match self.ssl.get(&ssl_name, Some(&mc)).await {
            Err(e) if e.is_not_found() => {
                if let Err(create_err) = self.ssl.create(&ssl_name, &mc).await {
                    if create_err.is_quota_exceeded() {
                        self.state
                            .set_excluded_from_slo(id)
                            .await
                            .map_err(|e| Error::StdError(StdError::Internal(e.to_string())))?;
                    }
                    return Err(Error::from(create_err));
                }
                self.maybe_report_creation_latency(id, &mc).await?;
                Ok(SyncOutcome::Done)
            }
            Err(e) => Err(Error::from(e)),
            Ok(cert) if !domains_equal(&cert.domains, &mc.spec.domains) => {
                info!(cert = %ssl_name, mc = %id, "domain set changed, re-provisioning");
                self.ssl.delete(&ssl_name, Some(&mc)).await?;
                self.state
                    .clear_ssl_certificate_name(id)
                    .await
                    .map_err(|e| Error::StdError(StdError::Internal(e.to_string())))?;
                Ok(SyncOutcome::RequeueImmediately)
            }
            Ok(cert) => {
                let status = ManagedCertificateStatus {
                    certificate_status: cert.certificate_status,
                    certificate_name: ssl_name,
                    domain_status: cert
                        .domain_status
                        .into_iter()
                        .map(|d| DomainStatus { domain: d.domain, status: d.status })
                        .collect(),
                };
                let value = serde_json::to_value(&status)?;
                self.mc_client.patch_status(id, &value).await?;
                Ok(SyncOutcome::Done)
            }
        }
    }

    async fn maybe_report_creation_latency(&self, id: &CertId, mc: &ManagedCertificate) -> Result<(), Error> {
        let entry = self.state.get(id).await.map_err(|e| Error::StdError(StdError::Internal(e.to_string())))?;
        if !entry.excluded_from_slo && !entry.ssl_certificate_creation_reported {
            if let Some(created) = mc.creation_timestamp() {
                let seconds = (Utc::now() - created).num_milliseconds() as f64 / 1000.0;
                self.metrics.observe_creation_latency(&id.to_string(), seconds.max(0.0));
            }
            self.state
                .set_ssl_certificate_creation_reported(id)
                .await
                .map_err(|e| Error::StdError(StdError::Internal(e.to_string())))?;
        }
        Ok(())
    }

    /// Spec §4.5 step 7. The state entry is only dropped once the SC is gone
    /// *and* no ingress annotation still references it — the Binder (C6)
    /// detaches those references in its own pass, so this function may run
    /// several times before the entry actually disappears.
    async fn soft_delete(&self, id: &CertId, mc: Option<&ManagedCertificate>) -> Result<SyncOutcome, Error> {
        let entry = self.state.get(id).await.map_err(|e| Error::StdError(StdError::Internal(e.to_string())))?;
        if !entry.has_ssl_certificate() {
            self.state.delete(id).await;
            return Ok(SyncOutcome::Done);
        }

        self.ssl.delete(&entry.ssl_certificate_name, mc).await?;

        let still_bound = self
            .ingress_client
            .list()
            .await
            .iter()
            .any(|ing| crate::api::parse_annotation_set(&ingress_pre_shared_cert(ing)).contains(&entry.ssl_certificate_name));

        if still_bound {
            warn!(mc = %id, cert = %entry.ssl_certificate_name, "soft-deleted certificate still bound to an ingress, deferring");
            return Ok(SyncOutcome::Done);
        }

        self.state.delete(id).await;
        Ok(SyncOutcome::Done)
    }
}

fn ingress_pre_shared_cert(ingress: &k8s_openapi::api::networking::v1::Ingress) -> String {
    use kube::ResourceExt;
    ingress
        .annotations()
        .get(crate::api::PRE_SHARED_CERT_ANNOTATION)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ManagedCertificateSpec, SslCertificate};
    use crate::clients::ingress::FakeIngressClient;
    use crate::clients::managed_certificate::FakeManagedCertificateClient;
    use crate::clients::ssl_certificate::FakeSslCertificateClient;
    use crate::events::FakeEventEmitter;
    use crate::metrics::Metrics;
    use crate::state::StateStore;
    use kube::core::ObjectMeta;

    fn mc(ns: &str, name: &str, domains: &[&str]) -> ManagedCertificate {
        let mut m = ManagedCertificate::new(
            name,
            ManagedCertificateSpec {
                domains: domains.iter().map(|d| d.to_string()).collect(),
            },
        );
        m.meta_mut().namespace = Some(ns.to_string());
        m
    }

    fn harness() -> (
        Synchronizer,
        Arc<FakeManagedCertificateClient>,
        Arc<FakeSslCertificateClient>,
        Arc<FakeIngressClient>,
        Arc<StateStore>,
    ) {
        let state = Arc::new(StateStore::empty());
        let mc_client = Arc::new(FakeManagedCertificateClient::new());
        let ingress_client = Arc::new(FakeIngressClient::new());
        let ssl_client = Arc::new(FakeSslCertificateClient::new());
        let events = Arc::new(FakeEventEmitter::new());
        let metrics = Arc::new(Metrics::default());
        let ssl = Arc::new(SslManager::new(ssl_client.clone(), events, metrics.clone()));
        let sync = Synchronizer::new(state.clone(), mc_client.clone(), ingress_client.clone(), ssl, metrics);
        (sync, mc_client, ssl_client, ingress_client, state)
    }

    #[tokio::test]
    async fn first_pass_allocates_name_and_creates_certificate() {
        let (sync, mc_client, ssl_client, _ing, state) = harness();
        let id = CertId::new("default", "foo");
        mc_client.objects.write().await.insert(id.clone(), mc("default", "foo", &["a.example"]));

        let outcome = sync.sync(&id).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Done);

        let entry = state.get(&id).await.unwrap();
        assert!(entry.has_ssl_certificate());
        assert!(entry.ssl_certificate_creation_reported);
        assert!(ssl_client.certs.read().await.contains_key(&entry.ssl_certificate_name));
    }

    #[tokio::test]
    async fn second_pass_with_matching_domains_patches_status() {
        let (sync, mc_client, _ssl_client, _ing, _state) = harness();
        let id = CertId::new("default", "foo");
        mc_client.objects.write().await.insert(id.clone(), mc("default", "foo", &["a.example"]));

        sync.sync(&id).await.unwrap();
        sync.sync(&id).await.unwrap();

        let patched = mc_client.get(&id).await.unwrap();
        assert_eq!(patched.status.unwrap().certificate_status, "ACTIVE");
    }

    #[tokio::test]
    async fn domain_mismatch_triggers_reprovision() {
        let (sync, mc_client, ssl_client, _ing, state) = harness();
        let id = CertId::new("default", "foo");
        mc_client.objects.write().await.insert(id.clone(), mc("default", "foo", &["a.example"]));
        sync.sync(&id).await.unwrap();

        let old_name = state.get(&id).await.unwrap().ssl_certificate_name;
        mc_client
            .objects
            .write()
            .await
            .insert(id.clone(), mc("default", "foo", &["b.example"]));

        let outcome = sync.sync(&id).await.unwrap();
        assert_eq!(outcome, SyncOutcome::RequeueImmediately);
        assert!(!ssl_client.certs.read().await.contains_key(&old_name));
        assert!(state.contains(&id).await, "entry must survive a domain-change replacement, only the SC name clears");
        assert!(!state.get(&id).await.unwrap().has_ssl_certificate());
    }

    /// P2/scenario 6: the reported-once flags must stay monotone across a
    /// domain-change replacement — a second successful provision must not
    /// re-record creation latency just because the SC name changed under it.
    #[tokio::test]
    async fn reported_flags_stay_monotone_across_domain_change_replacement() {
        let (sync, mc_client, _ssl_client, _ing, state) = harness();
        let id = CertId::new("default", "foo");
        mc_client.objects.write().await.insert(id.clone(), mc("default", "foo", &["a.example"]));
        sync.sync(&id).await.unwrap();
        assert!(state.get(&id).await.unwrap().ssl_certificate_creation_reported);

        mc_client
            .objects
            .write()
            .await
            .insert(id.clone(), mc("default", "foo", &["b.example"]));
        let outcome = sync.sync(&id).await.unwrap();
        assert_eq!(outcome, SyncOutcome::RequeueImmediately);
        // the re-provision cleared only the SC name; the reported flag must
        // still read true even though there is currently no certificate.
        assert!(state.get(&id).await.unwrap().ssl_certificate_creation_reported);

        sync.sync(&id).await.unwrap();
        let entry = state.get(&id).await.unwrap();
        assert!(entry.has_ssl_certificate());
        assert!(
            entry.ssl_certificate_creation_reported,
            "flag must remain true, not reset by the domain-change replacement"
        );
    }

    #[tokio::test]
    async fn quota_exceeded_on_create_excludes_entry_from_slo() {
        let (sync, mc_client, ssl_client, _ing, state) = harness();
        let id = CertId::new("default", "foo");
        mc_client.objects.write().await.insert(id.clone(), mc("default", "foo", &["a.example"]));
        ssl_client
            .fail_next_create_with(crate::errors::CloudError::new("quota", vec!["QUOTA_EXCEEDED".into()], Some(403)))
            .await;

        let err = sync.sync(&id).await.unwrap_err();
        assert!(err.metric_label() == "quota_exceeded");
        assert!(state.get(&id).await.unwrap().excluded_from_slo);

        // a later successful provision must not record creation latency.
        let outcome = sync.sync(&id).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Done);
        let entry = state.get(&id).await.unwrap();
        assert!(entry.has_ssl_certificate());
        assert!(!entry.ssl_certificate_creation_reported, "excluded entries must never report creation latency");
    }

    #[tokio::test]
    async fn mc_removal_without_prior_certificate_drops_entry_immediately() {
        let (sync, _mc_client, _ssl_client, _ing, state) = harness();
        let id = CertId::new("default", "ghost");
        state.ensure_exists(&id).await;

        sync.sync(&id).await.unwrap();
        assert!(!state.contains(&id).await);
    }

    #[tokio::test]
    async fn mc_removal_with_certificate_soft_deletes_then_forgets_once_unbound() {
        let (sync, mc_client, ssl_client, _ing, state) = harness();
        let id = CertId::new("default", "foo");
        mc_client.objects.write().await.insert(id.clone(), mc("default", "foo", &["a.example"]));
        sync.sync(&id).await.unwrap();
        let name = state.get(&id).await.unwrap().ssl_certificate_name;

        mc_client.objects.write().await.remove(&id);
        sync.sync(&id).await.unwrap();

        assert!(!state.contains(&id).await);
        assert!(!ssl_client.certs.read().await.contains_key(&name));
    }

    #[tokio::test]
    async fn soft_delete_is_deferred_while_an_ingress_still_references_the_cert() {
        let (sync, mc_client, _ssl_client, ing, state) = harness();
        let id = CertId::new("default", "foo");
        mc_client.objects.write().await.insert(id.clone(), mc("default", "foo", &["a.example"]));
        sync.sync(&id).await.unwrap();
        let name = state.get(&id).await.unwrap().ssl_certificate_name;

        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(crate::api::PRE_SHARED_CERT_ANNOTATION.to_string(), name.clone());
        ing.insert(k8s_openapi::api::networking::v1::Ingress {
            metadata: ObjectMeta {
                namespace: Some("default".into()),
                name: Some("still-bound".into()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        })
        .await;

        mc_client.objects.write().await.remove(&id);
        sync.sync(&id).await.unwrap();

        assert!(state.contains(&id).await, "entry must survive while an ingress still references the cert");
        let entry = state.get(&id).await.unwrap();
        assert!(entry.soft_deleted);
    }
}
