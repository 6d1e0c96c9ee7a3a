//! Wire types for the three external surfaces this controller reconciles
//! (spec §3 DATA MODEL): the ManagedCertificate CRD, the cloud SslCertificate
//! resource, and the two ingress annotations.

use chrono::{DateTime, Utc};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Generates the Kubernetes wrapper struct `ManagedCertificate` from our spec
/// and status structs; `crdgen` uses this to emit the CRD YAML.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "ManagedCertificate",
    group = "networking.gke.io",
    version = "v1",
    namespaced,
    shortname = "mcrt"
)]
#[kube(status = "ManagedCertificateStatus")]
pub struct ManagedCertificateSpec {
    /// Ordered list of DNS domains the certificate should cover.
    pub domains: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct ManagedCertificateStatus {
    #[serde(default)]
    pub certificate_status: String,
    #[serde(default)]
    pub certificate_name: String,
    #[serde(default)]
    pub domain_status: Vec<DomainStatus>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct DomainStatus {
    pub domain: String,
    pub status: String,
}

impl ManagedCertificate {
    pub fn creation_timestamp(&self) -> Option<DateTime<Utc>> {
        self.meta().creation_timestamp.as_ref().map(|t| t.0)
    }
}

/// Cloud-provider managed TLS certificate resource (spec: SslCertificate).
///
/// Not a Kubernetes object: exchanged with the cloud compute backend over
/// plain HTTP, so it carries no `ObjectMeta`/`TypeMeta`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SslCertificate {
    pub name: String,
    #[serde(rename = "type")]
    pub cert_type: String,
    pub domains: Vec<String>,
    #[serde(default)]
    pub certificate_status: String,
    #[serde(default)]
    pub domain_status: Vec<DomainStatus>,
}

pub const MANAGED_CERTIFICATE_TYPE: &str = "MANAGED";

impl SslCertificate {
    pub fn new(name: impl Into<String>, domains: Vec<String>) -> Self {
        SslCertificate {
            name: name.into(),
            cert_type: MANAGED_CERTIFICATE_TYPE.to_string(),
            domains,
            certificate_status: String::new(),
            domain_status: Vec::new(),
        }
    }
}

/// P5: domain-list equality is order-insensitive (multiset equality).
pub fn domains_equal(a: &[String], b: &[String]) -> bool {
    let sa: HashSet<&String> = a.iter().collect();
    let sb: HashSet<&String> = b.iter().collect();
    sa == sb && a.len() == b.len()
}

pub const MANAGED_CERTIFICATES_ANNOTATION: &str = "networking.gke.io/managed-certificates";
pub const PRE_SHARED_CERT_ANNOTATION: &str = "ingress.gcp.kubernetes.io/pre-shared-cert";

/// Predicate selecting which ingresses this controller should manage
/// (spec §9 `IsGKE` open question): injected rather than hardcoded so the
/// exact ingress-class heuristic is a deployment-time decision.
pub type IngressClassPredicate = fn(&Ingress) -> bool;

/// Default predicate: the ingress class (new-style `spec.ingressClassName`
/// or the legacy `kubernetes.io/ingress.class` annotation) names the
/// cluster-native GCE load balancer controller.
pub fn is_gce_ingress(ingress: &Ingress) -> bool {
    if let Some(class) = ingress.spec.as_ref().and_then(|s| s.ingress_class_name.as_ref()) {
        return class == "gce";
    }
    if let Some(class) = ingress.annotations().get("kubernetes.io/ingress.class") {
        return class == "gce";
    }
    // No class specified at all: GCE is the default controller on GKE.
    true
}

/// P6: parse a comma-separated annotation value into a deduplicated,
/// whitespace-trimmed set, dropping empty elements.
pub fn parse_annotation_set(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Serialize a set of certificate names as a sorted, comma-joined,
/// diff-stable string (spec §4.6 step 6, §8 P3).
pub fn format_annotation_set<'a, I: IntoIterator<Item = &'a String>>(names: I) -> String {
    let mut v: Vec<&str> = names.into_iter().map(String::as_str).collect();
    v.sort_unstable();
    v.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_equal_is_order_insensitive() {
        assert!(domains_equal(
            &["a".to_string(), "b".to_string()],
            &["b".to_string(), "a".to_string()]
        ));
        assert!(!domains_equal(&["a".to_string()], &["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn parse_annotation_set_p6() {
        assert!(parse_annotation_set("").is_empty());
        assert!(parse_annotation_set(",").is_empty());
        let parsed = parse_annotation_set(" a , b , a ");
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains("a"));
        assert!(parsed.contains("b"));
    }

    #[test]
    fn format_annotation_set_is_sorted() {
        let names: Vec<String> = vec!["b".into(), "a".into()];
        assert_eq!(format_annotation_set(&names), "a,b");
    }
}
