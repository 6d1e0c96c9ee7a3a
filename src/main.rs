use actix_web::{get, middleware, web, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use clap::Parser;
use controller::binder::Binder;
use controller::clients::ingress::IngressClient;
use controller::clients::managed_certificate::ManagedCertificateClient;
use controller::clients::ssl_certificate::GceSslCertificateClient;
use controller::config::{resolve_credential_source, Config, CredentialSource};
use controller::events::KubeEventEmitter;
use controller::metrics::Metrics;
use controller::orchestrator::{spawn_ingress_reflector, spawn_mc_reflector, Orchestrator, OrchestratorConfig};
use controller::ssl_manager::SslManager;
use controller::state::{ConfigMapPersistence, StateStore};
use controller::synchronizer::Synchronizer;
use controller::telemetry;
use controller::watchdog::{Watchdog, WatchdogConfig};
use kube::{Client, Config as KubeConfig};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tokio::sync::watch;

struct MetricsState {
    registry: Registry,
}

#[get("/metrics")]
async fn metrics(state: Data<MetricsState>, _req: HttpRequest) -> impl Responder {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&state.registry.gather(), &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

struct HealthState {
    watchdog: Watchdog,
}

async fn health_check(state: Data<HealthState>, _req: HttpRequest) -> impl Responder {
    let report = state.watchdog.check().await;
    if report.healthy {
        HttpResponse::Ok().json(report)
    } else {
        HttpResponse::ServiceUnavailable().json(report)
    }
}

async fn build_kube_client(config: &Config) -> anyhow::Result<Client> {
    let mut kube_config = if config.kube_config_file_path.is_empty() {
        KubeConfig::infer().await?
    } else {
        let kubeconfig = kube::config::Kubeconfig::read_from(&config.kube_config_file_path)?;
        KubeConfig::from_custom_kubeconfig(kubeconfig, &kube::config::KubeConfigOptions::default()).await?
    };
    if !config.apiserver_host.is_empty() {
        kube_config.cluster_url = config.apiserver_host.parse()?;
    }
    Ok(Client::try_from(kube_config)?)
}

/// Acquires a bearer token for the cloud compute backend per the resolved
/// credential source (spec §6 Environment). Token exchange internals are
/// out of scope for this controller (see SPEC_FULL.md §"Out of scope");
/// each branch reads the material the spec names and returns it directly
/// rather than performing a full OAuth2 flow.
async fn resolve_access_token(source: &CredentialSource) -> anyhow::Result<String> {
    match source {
        CredentialSource::ApplicationDefault => {
            let path = std::env::var("GOOGLE_APPLICATION_CREDENTIALS")?;
            Ok(tokio::fs::read_to_string(path).await?.trim().to_string())
        }
        CredentialSource::GceConfigFile(path) => Ok(tokio::fs::read_to_string(path).await?.trim().to_string()),
        CredentialSource::MetadataServer => {
            #[derive(serde::Deserialize)]
            struct MetadataToken {
                access_token: String,
            }
            let resp = reqwest::Client::new()
                .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
                .header("Metadata-Flavor", "Google")
                .send()
                .await?
                .json::<MetadataToken>()
                .await?;
            Ok(resp.access_token)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    telemetry::init().await;

    let client = build_kube_client(&config).await?;

    let credential_source = resolve_credential_source(&config);
    let token = resolve_access_token(&credential_source).await?;
    let project = std::env::var("GCE_PROJECT").unwrap_or_default();
    let ssl_client = Arc::new(GceSslCertificateClient::new("https://compute.googleapis.com/compute/v1", project, token));

    let persistence = Arc::new(ConfigMapPersistence::new(client.clone()));
    let state = Arc::new(StateStore::new(persistence).await);

    let events = Arc::new(KubeEventEmitter::new(client.clone()));
    let registry = Registry::new();
    let metrics = Arc::new(Metrics::default().register(&registry)?);

    let ssl_manager = Arc::new(SslManager::new(ssl_client, events.clone(), metrics.clone()));

    let watchdog = Watchdog::new(WatchdogConfig {
        interval: config.health_check_interval,
        enabled: true,
        ..WatchdogConfig::default()
    });

    let orchestrator = Orchestrator::new(
        watchdog.clone(),
        OrchestratorConfig {
            resync_interval: config.resync_interval,
            ..OrchestratorConfig::default()
        },
    );

    let (mc_client, mc_drive) = spawn_mc_reflector(client.clone(), orchestrator.mc_queue());
    let (ingress_client, ingress_drive) = spawn_ingress_reflector(client.clone(), orchestrator.ingress_queue());

    let synchronizer = Synchronizer::new(
        state.clone(),
        mc_client.clone() as Arc<dyn ManagedCertificateClient>,
        ingress_client.clone() as Arc<dyn IngressClient>,
        ssl_manager,
        metrics.clone(),
    );
    let binder = Binder::new(
        state.clone(),
        mc_client.clone() as Arc<dyn ManagedCertificateClient>,
        ingress_client.clone() as Arc<dyn IngressClient>,
        events,
        metrics,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_fut = async {
        tokio::join!(orchestrator.run(&state, &synchronizer, &binder, mc_client, ingress_client, shutdown_rx), mc_drive, ingress_drive);
    };

    let metrics_state = Data::new(MetricsState { registry });
    let metrics_server = HttpServer::new(move || App::new().app_data(metrics_state.clone()).wrap(middleware::Logger::default()).service(metrics))
        .bind(config.prometheus_bind())?
        .shutdown_timeout(5)
        .run();

    let health_check_path = config.health_check_path.clone();
    let health_state = Data::new(HealthState { watchdog });
    let health_server = HttpServer::new(move || {
        App::new()
            .app_data(health_state.clone())
            .route(&health_check_path, web::get().to(health_check))
    })
    .bind(config.health_check_bind())?
    .shutdown_timeout(5)
    .run();

    tokio::select! {
        _ = controller_fut => {}
        result = metrics_server => { result?; }
        result = health_server => { result?; }
        _ = tokio::signal::ctrl_c() => {
            let _ = shutdown_tx.send(true);
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
