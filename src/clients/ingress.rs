//! Ingress client façade (spec C3), including the ingress-class filter that
//! keeps off-class ingresses out of the work queue (spec §4.3).

use crate::api::{is_gce_ingress, IngressClassPredicate};
use crate::errors::Error;
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait IngressClient: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Option<Ingress>;
    async fn list(&self) -> Vec<Ingress>;
    fn has_synced(&self) -> bool;
    /// Patches `.metadata.annotations` with a JSON-merge-patch, skipping
    /// no-op updates.
    async fn patch_annotations(&self, namespace: &str, name: &str, annotations: BTreeMap<String, String>) -> Result<(), Error>;
}

pub struct KubeIngressClient {
    client: Client,
    store: Store<Ingress>,
    class_predicate: IngressClassPredicate,
}

impl KubeIngressClient {
    pub fn new(client: Client, store: Store<Ingress>, class_predicate: IngressClassPredicate) -> Self {
        KubeIngressClient {
            client,
            store,
            class_predicate,
        }
    }

    pub fn default_predicate() -> IngressClassPredicate {
        is_gce_ingress
    }

    fn api(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Ingresses of a foreign load-balancer class never reach callers
    /// (spec §4.3 "Ingress filtering").
    fn in_scope(&self, ingress: &Ingress) -> bool {
        (self.class_predicate)(ingress)
    }
}

#[async_trait]
impl IngressClient for KubeIngressClient {
    async fn get(&self, namespace: &str, name: &str) -> Option<Ingress> {
        self.store
            .state()
            .into_iter()
            .find(|ing| ing.namespace().as_deref() == Some(namespace) && ing.name_any() == name)
            .map(|arc| (*arc).clone())
            .filter(|ing| self.in_scope(ing))
    }

    async fn list(&self) -> Vec<Ingress> {
        self.store
            .state()
            .into_iter()
            .map(|arc| (*arc).clone())
            .filter(|ing| self.in_scope(ing))
            .collect()
    }

    fn has_synced(&self) -> bool {
        self.store.is_ready()
    }

    async fn patch_annotations(&self, namespace: &str, name: &str, annotations: BTreeMap<String, String>) -> Result<(), Error> {
        let current = self
            .get(namespace, name)
            .await
            .map(|i| i.annotations().clone())
            .unwrap_or_default();
        if current == annotations {
            return Ok(());
        }
        let patch = serde_json::json!({
            "metadata": { "annotations": annotations },
        });
        self.api(namespace)
            .patch(name, &PatchParams::apply("mcrt-controller"), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

pub fn watcher_config() -> watcher::Config {
    watcher::Config::default()
}

#[cfg(test)]
pub struct FakeIngressClient {
    pub objects: RwLock<BTreeMap<(String, String), Ingress>>,
    pub synced: bool,
    pub class_predicate: IngressClassPredicate,
}

#[cfg(test)]
impl FakeIngressClient {
    pub fn new() -> Self {
        FakeIngressClient {
            objects: RwLock::new(BTreeMap::new()),
            synced: true,
            class_predicate: is_gce_ingress,
        }
    }

    pub async fn insert(&self, ingress: Ingress) {
        let ns = ingress.namespace().unwrap_or_default();
        let name = ingress.name_any();
        self.objects.write().await.insert((ns, name), ingress);
    }
}

#[cfg(test)]
#[async_trait]
impl IngressClient for FakeIngressClient {
    async fn get(&self, namespace: &str, name: &str) -> Option<Ingress> {
        self.objects
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .filter(|ing| (self.class_predicate)(ing))
    }

    async fn list(&self) -> Vec<Ingress> {
        self.objects
            .read()
            .await
            .values()
            .filter(|ing| (self.class_predicate)(ing))
            .cloned()
            .collect()
    }

    fn has_synced(&self) -> bool {
        self.synced
    }

    async fn patch_annotations(&self, namespace: &str, name: &str, annotations: BTreeMap<String, String>) -> Result<(), Error> {
        let mut objects = self.objects.write().await;
        let key = (namespace.to_string(), name.to_string());
        let ing = objects
            .get_mut(&key)
            .ok_or_else(|| Error::StdError(crate::errors::StdError::NotFound(format!("{namespace}/{name}"))))?;
        if ing.annotations().clone() == annotations {
            return Ok(());
        }
        ing.meta_mut().annotations = Some(annotations);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;

    fn ingress(ns: &str, name: &str, annotations: BTreeMap<String, String>) -> Ingress {
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

    #[tokio::test]
    async fn patch_annotations_skips_when_unchanged() {
        let fake = FakeIngressClient::new();
        let mut ann = BTreeMap::new();
        ann.insert("a".to_string(), "b".to_string());
        fake.insert(ingress("default", "ing", ann.clone())).await;

        fake.patch_annotations("default", "ing", ann).await.unwrap();
        // No panic, no error: idempotent no-op patch.
    }

    #[tokio::test]
    async fn get_filters_out_of_class_ingress() {
        let fake = FakeIngressClient {
            objects: RwLock::new(BTreeMap::new()),
            synced: true,
            class_predicate: |_| false,
        };
        fake.insert(ingress("default", "ing", BTreeMap::new())).await;
        assert!(fake.get("default", "ing").await.is_none());
        assert!(fake.list().await.is_empty());
    }
}
