//! MC identity and cloud-resource name generation (spec C1).

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a ManagedCertificate by (namespace, name).
///
/// String form is `namespace:name`, used as the persisted state's logical
/// key and for log/diagnostic output.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CertId {
    pub namespace: String,
    pub name: String,
}

impl CertId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        CertId {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CertId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

const SSL_CERTIFICATE_NAME_PREFIX: &str = "mcert";
const MAX_SSL_CERTIFICATE_NAME_LEN: usize = 63;

/// Generates a fresh SslCertificate name: `mcert` followed by a 128-bit
/// random identifier in hex, truncated to the cloud resource name limit.
///
/// Process-unique with overwhelming probability; the only failure mode is
/// OS entropy exhaustion, which `rand`'s thread RNG surfaces as a panic
/// rather than a `Result`, so this function is infallible by contract.
pub fn random_ssl_certificate_name() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    let full = format!("{SSL_CERTIFICATE_NAME_PREFIX}{hex}");
    full.chars().take(MAX_SSL_CERTIFICATE_NAME_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn cert_id_display() {
        let id = CertId::new("default", "foo");
        assert_eq!(id.to_string(), "default:foo");
    }

    #[test]
    fn generated_names_are_bounded_and_prefixed() {
        let name = random_ssl_certificate_name();
        assert!(name.starts_with(SSL_CERTIFICATE_NAME_PREFIX));
        assert!(name.len() <= MAX_SSL_CERTIFICATE_NAME_LEN);
    }

    #[test]
    fn generated_names_are_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(random_ssl_certificate_name()));
        }
    }

    #[test]
    fn cert_id_ord_is_namespace_then_name() {
        let mut ids = vec![
            CertId::new("b", "a"),
            CertId::new("a", "z"),
            CertId::new("a", "a"),
        ];
        ids.sort();
        assert_eq!(ids[0], CertId::new("a", "a"));
        assert_eq!(ids[1], CertId::new("a", "z"));
        assert_eq!(ids[2], CertId::new("b", "a"));
    }
}
