//! ManagedCertificate client façade (spec C3).

use crate::api::ManagedCertificate;
use crate::errors::{Error, StdError};
use crate::identity::CertId;
use async_trait::async_trait;
use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Read/write contract the Synchronizer and Binder need against the MC
/// cache. `has_synced` lets callers (the full-resync tick) wait for the
/// informer cache to warm up before trusting `list`.
#[async_trait]
pub trait ManagedCertificateClient: Send + Sync {
    async fn get(&self, id: &CertId) -> Option<ManagedCertificate>;
    async fn list(&self) -> Vec<ManagedCertificate>;
    fn has_synced(&self) -> bool;
    /// Patches `.status` with a JSON-merge-patch, skipping no-op updates.
    async fn patch_status(&self, id: &CertId, status: &Value) -> Result<(), Error>;
}

/// Cluster-backed implementation wrapping a `kube::runtime::reflector`
/// cache and a `kube::Api` for writes.
pub struct KubeManagedCertificateClient {
    client: Client,
    store: Store<ManagedCertificate>,
}

impl KubeManagedCertificateClient {
    /// Spawns the watcher/reflector pair and returns the client plus the
    /// background task driving it. The caller is responsible for polling
    /// the returned stream to keep the cache warm (see
    /// `orchestrator::spawn_reflector`).
    pub fn new(client: Client, store: Store<ManagedCertificate>) -> Self {
        KubeManagedCertificateClient { client, store }
    }

    pub fn api_all(client: &Client) -> Api<ManagedCertificate> {
        Api::all(client.clone())
    }

    pub fn api(&self, namespace: &str) -> Api<ManagedCertificate> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ManagedCertificateClient for KubeManagedCertificateClient {
    async fn get(&self, id: &CertId) -> Option<ManagedCertificate> {
        self.store
            .state()
            .into_iter()
            .find(|mc| mc.namespace().as_deref() == Some(&id.namespace) && mc.name_any() == id.name)
            .map(|arc| (*arc).clone())
    }

    async fn list(&self) -> Vec<ManagedCertificate> {
        self.store.state().into_iter().map(|arc| (*arc).clone()).collect()
    }

    fn has_synced(&self) -> bool {
        self.store.is_ready()
    }

    async fn patch_status(&self, id: &CertId, status: &Value) -> Result<(), Error> {
        let current = self.get(id).await.ok_or_else(|| {
            Error::StdError(StdError::NotFound(format!("ManagedCertificate {id} vanished before status patch")))
        })?;
        let current_status = serde_json::to_value(current.status.clone().unwrap_or_default()).unwrap_or(Value::Null);
        if super::merge_patch_diff(&current_status, status).is_none() {
            return Ok(());
        }
        let patch = json!({
            "apiVersion": "networking.gke.io/v1",
            "kind": "ManagedCertificate",
            "status": status,
        });
        self.api(&id.namespace)
            .patch_status(&id.name, &PatchParams::apply("mcrt-controller").force(), &Patch::Apply(&patch))
            .await?;
        Ok(())
    }
}

/// Watcher configuration constructor for `kube::runtime::watcher`, exposed
/// so the orchestrator can start the MC informer task.
pub fn watcher_config() -> watcher::Config {
    watcher::Config::default()
}

/// In-memory fake used in unit tests (spec §9 Design Notes: "tests
/// substitute in-memory fakes").
#[cfg(test)]
pub struct FakeManagedCertificateClient {
    pub objects: RwLock<BTreeMap<CertId, ManagedCertificate>>,
    pub synced: bool,
    pub patches: RwLock<Vec<(CertId, Value)>>,
}

#[cfg(test)]
impl FakeManagedCertificateClient {
    pub fn new() -> Self {
        FakeManagedCertificateClient {
            objects: RwLock::new(BTreeMap::new()),
            synced: true,
            patches: RwLock::new(Vec::new()),
        }
    }

    pub async fn with(self: Arc<Self>, id: CertId, mc: ManagedCertificate) -> Arc<Self> {
        self.objects.write().await.insert(id, mc);
        self
    }
}

#[cfg(test)]
#[async_trait]
impl ManagedCertificateClient for FakeManagedCertificateClient {
    async fn get(&self, id: &CertId) -> Option<ManagedCertificate> {
        self.objects.read().await.get(id).cloned()
    }

    async fn list(&self) -> Vec<ManagedCertificate> {
        self.objects.read().await.values().cloned().collect()
    }

    fn has_synced(&self) -> bool {
        self.synced
    }

    async fn patch_status(&self, id: &CertId, status: &Value) -> Result<(), Error> {
        let mut objects = self.objects.write().await;
        let mc = objects
            .get_mut(id)
            .ok_or_else(|| Error::StdError(StdError::NotFound(id.to_string())))?;
        let current_status = serde_json::to_value(mc.status.clone().unwrap_or_default()).unwrap_or(Value::Null);
        if super::merge_patch_diff(&current_status, status).is_none() {
            return Ok(());
        }
        mc.status = Some(
            serde_json::from_value(status.clone())
                .map_err(|e| Error::StdError(StdError::JsonSerializationError(e)))?,
        );
        self.patches.write().await.push((id.clone(), status.clone()));
        Ok(())
    }
}
