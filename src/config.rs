//! CLI flags and credential resolution (spec C10).
//!
//! Flags are parsed with `clap::Parser`, the pack's idiom for binaries that
//! take flags, rather than the teacher's bare `std::env::var` reads: these
//! flags are the controller's explicit external interface and deserve a
//! real parser.

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "mcrt-controller", about = "ManagedCertificate controller")]
pub struct Config {
    /// Cluster API URL override; empty means in-cluster discovery.
    #[arg(long, env = "APISERVER_HOST", default_value = "")]
    pub apiserver_host: String,

    /// Path to the cloud provider config file (token URL/body).
    #[arg(long, env = "GCE_CONFIG_FILE_PATH", default_value = "")]
    pub gce_config_file_path: String,

    /// Kubeconfig override for out-of-cluster runs.
    #[arg(long, env = "KUBE_CONFIG_FILE_PATH", default_value = "")]
    pub kube_config_file_path: String,

    /// Prometheus scrape listener address.
    #[arg(long, env = "PROMETHEUS_ADDRESS", default_value = ":8910")]
    pub prometheus_address: String,

    /// Full-resync tick period.
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "10m", value_parser = parse_duration)]
    pub resync_interval: Duration,

    /// Watchdog HTTP listener address.
    #[arg(long, env = "HEALTH_CHECK_ADDRESS", default_value = ":8089")]
    pub health_check_address: String,

    /// Watchdog URL path.
    #[arg(long, env = "HEALTH_CHECK_PATH", default_value = "/health-check")]
    pub health_check_path: String,

    /// Watchdog evaluation period.
    #[arg(long, env = "HEALTH_CHECK_INTERVAL", default_value = "5s", value_parser = parse_duration)]
    pub health_check_interval: Duration,

    /// Cloud service account used for metadata-server token requests.
    #[arg(long, env = "SERVICE_ACCOUNT", default_value = "")]
    pub service_account: String,
}

impl Config {
    pub fn prometheus_bind(&self) -> String {
        normalize_bind_address(&self.prometheus_address)
    }

    pub fn health_check_bind(&self) -> String {
        normalize_bind_address(&self.health_check_address)
    }
}

/// Flags like `:8910` follow the Go convention of a bare `:port`; turn that
/// into something `actix_web::HttpServer::bind` accepts.
fn normalize_bind_address(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

/// Minimal single-unit duration parser for flag values like `10m`, `30s`,
/// `500ms` — the pack carries no `humantime` dependency, so this covers the
/// units the spec's flags actually use rather than pulling one in for a
/// handful of suffixes.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split_at = raw.find(|c: char| !c.is_ascii_digit()).ok_or_else(|| format!("invalid duration: {raw}"))?;
    let (value, unit) = raw.split_at(split_at);
    let value: u64 = value.parse().map_err(|_| format!("invalid duration: {raw}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unrecognized duration unit {other:?} in {raw}")),
    }
}

/// Resolution order for cloud API credentials (spec §6 Environment):
/// `GOOGLE_APPLICATION_CREDENTIALS` env var, then `--gce-config-file-path`,
/// then the compute metadata server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    ApplicationDefault,
    GceConfigFile(String),
    MetadataServer,
}

pub fn resolve_credential_source(config: &Config) -> CredentialSource {
    if std::env::var("GOOGLE_APPLICATION_CREDENTIALS").is_ok() {
        CredentialSource::ApplicationDefault
    } else if !config.gce_config_file_path.is_empty() {
        CredentialSource::GceConfigFile(config.gce_config_file_path.clone())
    } else {
        CredentialSource::MetadataServer
    }
}
