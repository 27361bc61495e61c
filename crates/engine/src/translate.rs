//! Translation from raw wire objects to the canonical [`Config`] shape.

use std::collections::BTreeMap;

use chrono::DateTime;
use meshsync_core::{Config, ConfigMeta, Error, GroupVersionKind, RawObject, Result, SpecNormalizer};
use serde_json::Value as Json;

/// Map a raw object read at the `cluster` version into the canonical shape
/// reported at the `preferred` version. Pure: no store access, no dispatch;
/// the caller decides what a failure means.
pub(crate) fn translate_object(
    raw: &RawObject,
    cluster: &GroupVersionKind,
    preferred: &GroupVersionKind,
    normalizer: Option<&dyn SpecNormalizer>,
    domain_suffix: &str,
) -> Result<Config> {
    let meta = raw
        .get("metadata")
        .and_then(Json::as_object)
        .ok_or_else(|| Error::Translation(format!("{}: object has no metadata", cluster)))?;
    let name = meta
        .get("name")
        .and_then(Json::as_str)
        .ok_or_else(|| Error::Translation(format!("{}: object has no name", cluster)))?
        .to_string();
    let namespace = meta.get("namespace").and_then(Json::as_str).unwrap_or("").to_string();
    let resource_version =
        meta.get("resourceVersion").and_then(Json::as_str).unwrap_or("").to_string();
    let creation_timestamp = meta
        .get("creationTimestamp")
        .and_then(Json::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0);

    let spec = raw
        .get("spec")
        .cloned()
        .ok_or_else(|| Error::Translation(format!("{}: {} has no spec", cluster, name)))?;
    if !spec.is_object() {
        return Err(Error::Translation(format!("{}: {} spec is not an object", cluster, name)));
    }
    let spec = match normalizer {
        Some(n) => n.normalize(&cluster.version, spec)?,
        None => spec,
    };

    Ok(Config {
        meta: ConfigMeta {
            kind: preferred.clone(),
            name,
            namespace,
            domain: domain_suffix.to_string(),
            labels: string_map(meta.get("labels")),
            annotations: string_map(meta.get("annotations")),
            resource_version,
            creation_timestamp,
        },
        spec,
        status: raw.get("status").cloned(),
    })
}

/// Render a canonical config back into a raw object at the cluster version,
/// for pass-through writes. The spec payload goes through the normalizer in
/// reverse; server-owned fields (creationTimestamp) are left out.
pub(crate) fn to_raw(
    config: &Config,
    cluster: &GroupVersionKind,
    normalizer: Option<&dyn SpecNormalizer>,
) -> Result<RawObject> {
    let spec = match normalizer {
        Some(n) => n.denormalize(&cluster.version, config.spec.clone())?,
        None => config.spec.clone(),
    };
    let api_version = if cluster.group.is_empty() {
        cluster.version.clone()
    } else {
        format!("{}/{}", cluster.group, cluster.version)
    };

    let mut metadata = serde_json::Map::new();
    metadata.insert("name".into(), Json::String(config.meta.name.clone()));
    if !config.meta.namespace.is_empty() {
        metadata.insert("namespace".into(), Json::String(config.meta.namespace.clone()));
    }
    if !config.meta.resource_version.is_empty() {
        metadata.insert("resourceVersion".into(), Json::String(config.meta.resource_version.clone()));
    }
    if !config.meta.labels.is_empty() {
        metadata.insert("labels".into(), serde_json::to_value(&config.meta.labels).unwrap_or(Json::Null));
    }
    if !config.meta.annotations.is_empty() {
        metadata
            .insert("annotations".into(), serde_json::to_value(&config.meta.annotations).unwrap_or(Json::Null));
    }

    let mut raw = serde_json::Map::new();
    raw.insert("apiVersion".into(), Json::String(api_version));
    raw.insert("kind".into(), Json::String(cluster.kind.clone()));
    raw.insert("metadata".into(), Json::Object(metadata));
    raw.insert("spec".into(), spec);
    if let Some(status) = &config.status {
        raw.insert("status".into(), status.clone());
    }
    Ok(Json::Object(raw))
}

fn string_map(value: Option<&Json>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(obj) = value.and_then(Json::as_object) {
        for (k, v) in obj {
            if let Some(s) = v.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
    }
    out
}
