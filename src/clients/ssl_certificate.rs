//! Cloud SslCertificate client façade (spec C3/C4 collaborator).
//!
//! Long-running cloud operations are tracked by polling a "global
//! operations" endpoint every 10 seconds until the operation reaches
//! `DONE`, per spec §4.3. The resulting structured `CloudError` preserves
//! the backend's error codes so `is_quota_exceeded` can branch on
//! `QUOTA_EXCEEDED` without string matching.

use crate::api::SslCertificate;
use crate::errors::CloudError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(10);
const CLOUD_API_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait SslCertificateClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<SslCertificate, CloudError>;
    async fn list(&self) -> Result<Vec<SslCertificate>, CloudError>;
    async fn exists(&self, name: &str) -> Result<bool, CloudError> {
        match self.get(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
    async fn create(&self, name: &str, domains: Vec<String>) -> Result<(), CloudError>;
    async fn delete(&self, name: &str) -> Result<(), CloudError>;
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    status: String,
    #[serde(default)]
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Deserialize)]
struct OperationErrorItem {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Deserialize)]
struct ErrorBodyInner {
    code: u16,
    message: String,
    #[serde(default)]
    errors: Vec<OperationErrorItem>,
}

/// HTTP client for the cloud compute backend's SslCertificate collection,
/// modeled on GCE's `sslCertificates`/`globalOperations` resources.
pub struct GceSslCertificateClient {
    http: reqwest::Client,
    base_url: String,
    project: String,
    token: String,
}

impl GceSslCertificateClient {
    pub fn new(base_url: impl Into<String>, project: impl Into<String>, token: impl Into<String>) -> Self {
        GceSslCertificateClient {
            http: reqwest::Client::builder()
                .timeout(CLOUD_API_TIMEOUT)
                .build()
                .expect("reqwest client builder cannot fail with a static config"),
            base_url: base_url.into(),
            project: project.into(),
            token: token.into(),
        }
    }

    fn certs_url(&self) -> String {
        format!("{}/projects/{}/global/sslCertificates", self.base_url, self.project)
    }

    fn cert_url(&self, name: &str) -> String {
        format!("{}/{}", self.certs_url(), name)
    }

    fn operation_url(&self, operation_name: &str) -> String {
        format!("{}/projects/{}/global/operations/{}", self.base_url, self.project, operation_name)
    }

    async fn error_from_response(&self, resp: reqwest::Response) -> CloudError {
        let status = resp.status().as_u16();
        match resp.json::<ErrorBody>().await {
            Ok(body) => CloudError::new(
                body.error.message,
                body.error.errors.into_iter().map(|e| e.code).collect(),
                Some(status),
            ),
            Err(_) => CloudError::new(format!("cloud API returned status {status}"), vec![], Some(status)),
        }
    }

    /// Polls `operation_name` every 10s until `DONE`, selecting against no
    /// cancellation signal here (the caller's queue worker owns overall
    /// cancellation; see `orchestrator`).
    async fn await_operation(&self, operation_name: &str) -> Result<(), CloudError> {
        loop {
            let resp = self
                .http
                .get(self.operation_url(operation_name))
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| CloudError::new(e.to_string(), vec![], None))?;

            if !resp.status().is_success() {
                return Err(self.error_from_response(resp).await);
            }

            let op: OperationStatus = resp
                .json()
                .await
                .map_err(|e| CloudError::new(e.to_string(), vec![], None))?;

            if op.status == "DONE" {
                if let Some(err) = op.error {
                    let codes = err.errors.iter().map(|e| e.code.clone()).collect();
                    let message = err
                        .errors
                        .into_iter()
                        .map(|e| e.message)
                        .collect::<Vec<_>>()
                        .join("; ");
                    return Err(CloudError::new(message, codes, None));
                }
                return Ok(());
            }

            debug!(operation = operation_name, status = %op.status, "waiting on global operation");
            tokio::time::sleep(OPERATION_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl SslCertificateClient for GceSslCertificateClient {
    async fn get(&self, name: &str) -> Result<SslCertificate, CloudError> {
        let resp = self
            .http
            .get(self.cert_url(name))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CloudError::new(e.to_string(), vec![], None))?;
        if !resp.status().is_success() {
            return Err(self.error_from_response(resp).await);
        }
        resp.json().await.map_err(|e| CloudError::new(e.to_string(), vec![], None))
    }

    async fn list(&self) -> Result<Vec<SslCertificate>, CloudError> {
        #[derive(Deserialize)]
        struct ListResponse {
            #[serde(default)]
            items: Vec<SslCertificate>,
        }
        let resp = self
            .http
            .get(self.certs_url())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CloudError::new(e.to_string(), vec![], None))?;
        if !resp.status().is_success() {
            return Err(self.error_from_response(resp).await);
        }
        let body: ListResponse = resp.json().await.map_err(|e| CloudError::new(e.to_string(), vec![], None))?;
        Ok(body.items)
    }

    async fn create(&self, name: &str, domains: Vec<String>) -> Result<(), CloudError> {
        #[derive(Deserialize)]
        struct CreateResponse {
            name: String,
        }
        let cert = SslCertificate::new(name, domains);
        let resp = self
            .http
            .post(self.certs_url())
            .bearer_auth(&self.token)
            .json(&cert)
            .send()
            .await
            .map_err(|e| CloudError::new(e.to_string(), vec![], None))?;
        if !resp.status().is_success() {
            return Err(self.error_from_response(resp).await);
        }
        let op: CreateResponse = resp.json().await.map_err(|e| CloudError::new(e.to_string(), vec![], None))?;
        self.await_operation(&op.name).await
    }

    async fn delete(&self, name: &str) -> Result<(), CloudError> {
        #[derive(Deserialize)]
        struct DeleteResponse {
            name: String,
        }
        let resp = self
            .http
            .delete(self.cert_url(name))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CloudError::new(e.to_string(), vec![], None))?;
        if resp.status().as_u16() == 404 {
            return Err(CloudError::new("not found", vec![], Some(404)));
        }
        if !resp.status().is_success() {
            return Err(self.error_from_response(resp).await);
        }
        let op: DeleteResponse = resp.json().await.map_err(|e| CloudError::new(e.to_string(), vec![], None))?;
        self.await_operation(&op.name).await
    }
}

/// In-memory fake backend for unit tests. `fail_with` lets a test script a
/// one-shot error (e.g. `QUOTA_EXCEEDED`) for the next `create` call.
#[cfg(test)]
pub struct FakeSslCertificateClient {
    pub certs: RwLock<BTreeMap<String, SslCertificate>>,
    pub fail_next_create: RwLock<Option<CloudError>>,
}

#[cfg(test)]
impl FakeSslCertificateClient {
    pub fn new() -> Self {
        FakeSslCertificateClient {
            certs: RwLock::new(BTreeMap::new()),
            fail_next_create: RwLock::new(None),
        }
    }

    pub async fn fail_next_create_with(&self, error: CloudError) {
        *self.fail_next_create.write().await = Some(error);
    }
}

#[cfg(test)]
#[async_trait]
impl SslCertificateClient for FakeSslCertificateClient {
    async fn get(&self, name: &str) -> Result<SslCertificate, CloudError> {
        self.certs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::new("not found", vec![], Some(404)))
    }

    async fn list(&self) -> Result<Vec<SslCertificate>, CloudError> {
        Ok(self.certs.read().await.values().cloned().collect())
    }

    async fn create(&self, name: &str, domains: Vec<String>) -> Result<(), CloudError> {
        if let Some(err) = self.fail_next_create.write().await.take() {
            return Err(err);
        }
        let mut cert = SslCertificate::new(name, domains);
        cert.certificate_status = "ACTIVE".to_string();
        self.certs.write().await.insert(name.to_string(), cert);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), CloudError> {
        if self.certs.write().await.remove(name).is_none() {
            return Err(CloudError::new("not found", vec![], Some(404)));
        }
        Ok(())
    }
}
