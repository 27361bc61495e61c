//! Schema-version negotiation: decide which version to watch for each kind.

use std::collections::BTreeSet;

use meshsync_core::{Error, GroupVersionKind, KindRegistration, Result};
use tracing::{debug, warn};

/// The immutable (preferred, cluster) version pair a cache handler is bound
/// to for its whole lifetime. `preferred` is what the engine speaks
/// internally; `cluster` is what is actually read from and written to the
/// connected cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedKind {
    pub preferred: GroupVersionKind,
    pub cluster: GroupVersionKind,
}

impl NegotiatedKind {
    pub fn skewed(&self) -> bool {
        self.preferred.version != self.cluster.version
    }
}

/// Pick the watched version: the preferred one when served, else the first
/// served entry of the registration's fallback chain. A kind with no usable
/// served version cannot be watched at all, which is a startup failure.
pub fn negotiate(reg: &KindRegistration, served: &BTreeSet<String>) -> Result<NegotiatedKind> {
    let preferred = reg.preferred_gvk();
    if served.contains(&reg.preferred_version) {
        debug!(kind = %preferred, "watching preferred version");
        return Ok(NegotiatedKind { cluster: preferred.clone(), preferred });
    }
    for version in &reg.fallback_versions {
        if served.contains(version) {
            let cluster = preferred.with_version(version);
            warn!(kind = %preferred, cluster = %cluster, "preferred version not served; reading fallback");
            return Ok(NegotiatedKind { preferred, cluster });
        }
    }
    Err(Error::Configuration(format!(
        "no served schema version for {}: cluster serves {:?}, supported {:?}",
        preferred.kind_key(),
        served,
        std::iter::once(&reg.preferred_version).chain(&reg.fallback_versions).collect::<Vec<_>>(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn served(versions: &[&str]) -> BTreeSet<String> {
        versions.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn preferred_wins_when_served() {
        let reg = KindRegistration::new("g", "Widget", "v2").with_fallbacks(&["v1", "v1beta1"]);
        let nk = negotiate(&reg, &served(&["v1", "v2"])).unwrap();
        assert_eq!(nk.cluster.version, "v2");
        assert!(!nk.skewed());
    }

    #[test]
    fn fallback_follows_priority_order_not_cluster_order() {
        let reg = KindRegistration::new("g", "Widget", "v2").with_fallbacks(&["v1", "v1beta1"]);
        let nk = negotiate(&reg, &served(&["v1beta1", "v1"])).unwrap();
        assert_eq!(nk.cluster.version, "v1");
        assert_eq!(nk.preferred.version, "v2");
        assert!(nk.skewed());
    }

    #[test]
    fn no_usable_version_is_a_configuration_error() {
        let reg = KindRegistration::new("g", "Widget", "v2").with_fallbacks(&["v1"]);
        let err = negotiate(&reg, &served(&["v1alpha1"])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
