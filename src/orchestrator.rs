//! Controller Orchestrator (spec C9): owns the two work queues, the worker
//! tasks that drain them, the periodic full-resync ticker, and the watchdog
//! activity bookkeeping. The informer streams that feed the queues are
//! built by the free functions at the bottom of this module and driven
//! alongside `Orchestrator::run` by the caller (see `main`), so the
//! Synchronizer/Binder façades and the queue-feeding streams can share the
//! same reflector-backed client without a construction-order cycle.
//!
//! The informer wiring is grounded on a hand-rolled `kube::runtime::watcher`
//! + `reflector` stream rather than the higher-level
//! `kube::runtime::controller::Controller`: the spec calls for two
//! independently rate-limited work queues with their own worker pools, which
//! doesn't map onto `Controller`'s single reconcile callback.

use crate::binder::Binder;
use crate::clients::ingress::{watcher_config as ingress_watcher_config, KubeIngressClient};
use crate::clients::managed_certificate::{watcher_config as mc_watcher_config, KubeManagedCertificateClient};
use crate::identity::CertId;
use crate::state::StateStore;
use crate::synchronizer::{SyncOutcome, Synchronizer};
use crate::watchdog::{Activity, Watchdog};
use crate::workqueue::WorkQueue;
use futures::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::ManagedCertificate;

/// Ingress work-queue keys are plain (namespace, name) pairs: the Binder
/// re-derives everything else it needs from the ingress cache at process
/// time.
pub type IngressKey = (String, String);

pub struct OrchestratorConfig {
    pub mc_workers: usize,
    pub ingress_workers: usize,
    pub resync_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            mc_workers: 2,
            ingress_workers: 2,
            resync_interval: Duration::from_secs(10 * 60),
        }
    }
}

pub struct Orchestrator {
    watchdog: Watchdog,
    config: OrchestratorConfig,
    mc_queue: Arc<WorkQueue<CertId>>,
    ingress_queue: Arc<WorkQueue<IngressKey>>,
}

impl Orchestrator {
    pub fn new(watchdog: Watchdog, config: OrchestratorConfig) -> Self {
        Orchestrator {
            watchdog,
            config,
            mc_queue: WorkQueue::new(),
            ingress_queue: WorkQueue::new(),
        }
    }

    pub fn mc_queue(&self) -> Arc<WorkQueue<CertId>> {
        self.mc_queue.clone()
    }

    pub fn ingress_queue(&self) -> Arc<WorkQueue<IngressKey>> {
        self.ingress_queue.clone()
    }

    /// Drains the MC work queue: get a key, sync it, forget-or-reschedule
    /// per the outcome, mark done. Several of these run concurrently (spec
    /// §4.9 "N worker tasks per queue").
    async fn mc_worker(&self, synchronizer: &Synchronizer) {
        loop {
            let Some(id) = self.mc_queue.get().await else { break };
            self.watchdog.update_last_activity(Activity::McrtResyncProcess, chrono::Utc::now()).await;
            match synchronizer.sync(&id).await {
                Ok(SyncOutcome::Done) => self.mc_queue.forget(&id).await,
                Ok(SyncOutcome::RequeueImmediately) => {
                    self.mc_queue.forget(&id).await;
                    self.mc_queue.add(id.clone()).await;
                }
                Err(e) => {
                    warn!(mc = %id, error = %e, "sync failed, will retry");
                    self.mc_queue.add_rate_limited(id.clone()).await;
                }
            }
            self.mc_queue.done(&id).await;
        }
    }

    /// Drains the ingress work queue. Binding has no useful per-key
    /// shortcut (a single annotation change can affect attach/detach sets
    /// derived from every MC in the namespace), so each dequeue triggers a
    /// full `Binder::sync_all` pass rather than a per-ingress one; the
    /// dedup in `WorkQueue` still collapses bursts of events into a single
    /// pass.
    async fn ingress_worker(&self, binder: &Binder) {
        loop {
            let Some(key) = self.ingress_queue.get().await else { break };
            self.watchdog.update_last_activity(Activity::IngressResyncProcess, chrono::Utc::now()).await;
            binder.sync_all().await;
            self.ingress_queue.forget(&key).await;
            self.ingress_queue.done(&key).await;
        }
    }

    /// Enumerates MCs, ingresses, and known state-store entries to catch
    /// missed events and drive the soft-delete/detach lifecycle; runs on
    /// `resync_interval` and once at startup (spec §4.9).
    async fn resync_once(&self, state: &StateStore, mc_client: &KubeManagedCertificateClient, ingress_client: &KubeIngressClient) {
        use crate::clients::ingress::IngressClient as _;
        use crate::clients::managed_certificate::ManagedCertificateClient as _;

        for (id, _entry) in state.list().await {
            self.mc_queue.add(id).await;
        }

        let mcs = mc_client.list().await;
        for mc in &mcs {
            self.mc_queue.add(CertId::new(mc.namespace().unwrap_or_default(), mc.name_any())).await;
        }

        let ingresses = ingress_client.list().await;
        let ingress_count = ingresses.len();
        for ing in &ingresses {
            self.ingress_queue.add((ing.namespace().unwrap_or_default(), ing.name_any())).await;
        }

        self.watchdog
            .update_last_success_sync(chrono::Utc::now(), ingress_count, mcs.len())
            .await;
        self.watchdog.update_last_activity(Activity::SynchronizeAll, chrono::Utc::now()).await;
    }

    async fn run_periodic_resync(&self, state: &StateStore, mc_client: Arc<KubeManagedCertificateClient>, ingress_client: Arc<KubeIngressClient>, mut shutdown: watch::Receiver<bool>) {
        info!("running startup resync");
        self.resync_once(state, &mc_client, &ingress_client).await;

        let mut ticker = tokio::time::interval(self.config.resync_interval);
        ticker.tick().await; // first tick fires immediately; already resynced above
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!("running periodic resync");
                    self.resync_once(state, &mc_client, &ingress_client).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Runs the worker pools and the periodic resync ticker until
    /// `shutdown` fires. The caller additionally drives the informer
    /// streams returned by `spawn_mc_reflector`/`spawn_ingress_reflector`
    /// alongside this future (see `main`).
    pub async fn run(&self, state: &StateStore, synchronizer: &Synchronizer, binder: &Binder, mc_client: Arc<KubeManagedCertificateClient>, ingress_client: Arc<KubeIngressClient>, shutdown: watch::Receiver<bool>) {
        let mc_workers = futures::future::join_all((0..self.config.mc_workers).map(|_| self.mc_worker(synchronizer)));
        let ingress_workers = futures::future::join_all((0..self.config.ingress_workers).map(|_| self.ingress_worker(binder)));
        let resync = self.run_periodic_resync(state, mc_client, ingress_client, shutdown);
        tokio::join!(mc_workers, ingress_workers, resync);
    }

    pub async fn shutdown(&self) {
        self.mc_queue.shutdown().await;
        self.ingress_queue.shutdown().await;
    }
}

/// Builds the reflector-backed ManagedCertificate façade and the stream
/// that must be polled (see `main`'s top-level join) to keep both its
/// cache and `queue` fed from watch events.
pub fn spawn_mc_reflector(client: Client, queue: Arc<WorkQueue<CertId>>) -> (Arc<KubeManagedCertificateClient>, impl std::future::Future<Output = ()>) {
    let api: Api<ManagedCertificate> = Api::all(client.clone());
    let (store, writer) = reflector::store();
    let stream = watcher(api, mc_watcher_config()).default_backoff().reflect(writer).applied_objects();
    let facade = Arc::new(KubeManagedCertificateClient::new(client, store));
    let drive = async move {
        stream
            .for_each(|event| {
                let queue = queue.clone();
                async move {
                    match event {
                        Ok(mc) => queue.add(CertId::new(mc.namespace().unwrap_or_default(), mc.name_any())).await,
                        Err(e) => warn!(error = %e, "ManagedCertificate watch error"),
                    }
                }
            })
            .await;
    };
    (facade, drive)
}

/// Same as `spawn_mc_reflector` for ingresses.
pub fn spawn_ingress_reflector(client: Client, queue: Arc<WorkQueue<IngressKey>>) -> (Arc<KubeIngressClient>, impl std::future::Future<Output = ()>) {
    let api: Api<Ingress> = Api::all(client.clone());
    let (store, writer) = reflector::store();
    let stream = watcher(api, ingress_watcher_config()).default_backoff().reflect(writer).applied_objects();
    let predicate = KubeIngressClient::default_predicate();
    let facade = Arc::new(KubeIngressClient::new(client, store, predicate));
    let drive = async move {
        stream
            .for_each(|event| {
                let queue = queue.clone();
                async move {
                    match event {
                        Ok(ingress) => queue.add((ingress.namespace().unwrap_or_default(), ingress.name_any())).await,
                        Err(e) => warn!(error = %e, "Ingress watch error"),
                    }
                }
            })
            .await;
    };
    (facade, drive)
}
