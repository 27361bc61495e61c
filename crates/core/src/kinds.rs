//! Built-in mesh configuration kinds and their version fallback chains.

use std::sync::Arc;

use serde_json::Value as Json;

use crate::{Error, KindRegistration, Result, SpecNormalizer};

/// API group all built-in mesh kinds live under.
pub const MESH_GROUP: &str = "networking.meshsync.io";

/// Ingress/egress listener configuration.
pub fn gateway() -> KindRegistration {
    KindRegistration::new(MESH_GROUP, "Gateway", "v1").with_fallbacks(&["v1beta1"])
}

/// Weighted routing rules between workloads.
pub fn traffic_route() -> KindRegistration {
    KindRegistration::new(MESH_GROUP, "TrafficRoute", "v1")
        .with_fallbacks(&["v1beta1", "v1alpha2"])
        .with_normalizer(Arc::new(TrafficRouteCompat))
}

/// Per-destination load balancing and outlier detection.
pub fn destination_policy() -> KindRegistration {
    KindRegistration::new(MESH_GROUP, "DestinationPolicy", "v1").with_fallbacks(&["v1beta1"])
}

/// All kinds a mesh control plane watches by default.
pub fn builtin() -> Vec<KindRegistration> {
    vec![gateway(), traffic_route(), destination_policy()]
}

/// v1alpha2 TrafficRoute kept its backend list under `weightedBackends`;
/// v1beta1 and v1 renamed the field to `backends`. Shapes are otherwise
/// identical.
struct TrafficRouteCompat;

impl SpecNormalizer for TrafficRouteCompat {
    fn normalize(&self, source_version: &str, mut spec: Json) -> Result<Json> {
        if source_version == "v1alpha2" {
            let obj = spec
                .as_object_mut()
                .ok_or_else(|| Error::Translation("TrafficRoute spec is not an object".into()))?;
            if let Some(backends) = obj.remove("weightedBackends") {
                obj.insert("backends".to_string(), backends);
            }
        }
        Ok(spec)
    }

    fn denormalize(&self, target_version: &str, mut spec: Json) -> Result<Json> {
        if target_version == "v1alpha2" {
            let obj = spec
                .as_object_mut()
                .ok_or_else(|| Error::Translation("TrafficRoute spec is not an object".into()))?;
            if let Some(backends) = obj.remove("backends") {
                obj.insert("weightedBackends".to_string(), backends);
            }
        }
        Ok(spec)
    }
}
