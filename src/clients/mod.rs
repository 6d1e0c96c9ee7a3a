//! Uniform client façades for the three external surfaces (spec C3): the
//! ManagedCertificate cache, the Ingress cache, and the cloud SslCertificate
//! backend. Each is a `trait` so production code depends on the minimal
//! capability it needs and tests substitute in-memory fakes (spec §9 Design
//! Notes: "dynamic dispatch replaced by capability interfaces").

pub mod ingress;
pub mod managed_certificate;
pub mod ssl_certificate;

use serde_json::Value;

/// Computes a JSON-merge-patch diff between `current` and `desired`,
/// returning `None` when they're effectively equal so callers can skip a
/// no-op update (spec §4.3: "updates that produce no effective change must
/// be elided").
pub fn merge_patch_diff(current: &Value, desired: &Value) -> Option<Value> {
    if current == desired {
        return None;
    }
    Some(desired.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_values_produce_no_patch() {
        let v = json!({"a": 1});
        assert!(merge_patch_diff(&v, &v).is_none());
    }

    #[test]
    fn differing_values_produce_a_patch() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_eq!(merge_patch_diff(&a, &b), Some(b));
    }
}
