use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("resource is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("resource metadata did not deserialize: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("resource has no kind")]
    MissingKind,
}

// Wrapper keys descended, in order, when digging for a pod spec.
const POD_SPEC_FIELDS: [&str; 3] = ["jobTemplate", "spec", "template"];

/// Any Kubernetes object, examined structurally. Workloads additionally
/// carry their extracted pod spec and pod template.
#[derive(Debug, Clone)]
pub struct GenericResource {
    pub kind: String,
    pub api_version: String,
    pub object_meta: ObjectMeta,
    pub resource: Value,
    pub pod_spec: Option<Value>,
    pub pod_template: Option<Value>,
    /// Verbatim source text, kept so mutations can round-trip the original
    /// document. Absent for resources not built from YAML.
    pub original_yaml: Option<String>,
}

impl GenericResource {
    pub fn from_value(value: Value) -> Result<GenericResource, ResourceError> {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(ResourceError::MissingKind)?
            .to_string();
        let api_version = value
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let object_meta: ObjectMeta = match value.get("metadata") {
            Some(meta) => serde_json::from_value(meta.clone())?,
            None => ObjectMeta::default(),
        };
        let pod_spec = extract_pod_spec(&value).cloned();
        let pod_template = extract_pod_template(&value).cloned();
        Ok(GenericResource {
            kind,
            api_version,
            object_meta,
            pod_spec,
            pod_template,
            resource: value,
            original_yaml: None,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<GenericResource, ResourceError> {
        let mut value: Value = serde_yaml::from_str(raw)?;
        scrub(&mut value);
        let mut resource = GenericResource::from_value(value)?;
        resource.original_yaml = Some(raw.to_string());
        Ok(resource)
    }

    pub fn name(&self) -> &str {
        self.object_meta.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.object_meta.namespace.as_deref().unwrap_or_default()
    }

    /// Creation timestamp from metadata, converted to the `chrono` type the
    /// report uses for RFC-3339 rendering.
    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        let time = self.object_meta.creation_timestamp.as_ref()?;
        let nanos = u32::try_from(time.0.subsec_nanosecond()).ok()?;
        DateTime::from_timestamp(time.0.as_second(), nanos)
    }

    /// Registry key for this resource's kind. Core and workload API groups
    /// keep their bare kind for config compatibility; everything else is
    /// qualified as `group/Kind`.
    pub fn group_kind_key(&self) -> String {
        match self.api_version.split_once('/') {
            Some((group, _)) if group != "apps" && group != "batch" => {
                format!("{group}/{}", self.kind)
            }
            _ => self.kind.clone(),
        }
    }
}

/// Digs through wrapper objects until it finds a map holding `containers`.
pub fn extract_pod_spec(value: &Value) -> Option<&Value> {
    let map = value.as_object()?;
    for field in POD_SPEC_FIELDS {
        if let Some(inner) = map.get(field) {
            return extract_pod_spec(inner);
        }
    }
    if map.contains_key("containers") {
        Some(value)
    } else {
        None
    }
}

/// Returns the pod template wrapper (metadata + spec) if the resource has
/// one, e.g. `spec.template` for a Deployment.
pub fn extract_pod_template(value: &Value) -> Option<&Value> {
    let map = value.as_object()?;
    if let Some(template) = map.get("template") {
        return Some(template);
    }
    for field in POD_SPEC_FIELDS {
        if let Some(inner) = map.get(field) {
            return extract_pod_template(inner);
        }
    }
    None
}

// Server-populated noise makes schemas and fix diffs unstable.
fn scrub(value: &mut Value) {
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
    }
    scrub_timestamps(value);
}

fn scrub_timestamps(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.get("creationTimestamp") == Some(&Value::Null) {
                map.remove("creationTimestamp");
            }
            for (_, v) in map.iter_mut() {
                scrub_timestamps(v);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                scrub_timestamps(item);
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Path,
    Content,
    Cluster,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Path => "Path",
            SourceType::Content => "Content",
            SourceType::Cluster => "Cluster",
        }
    }
}

/// All resources under audit, keyed by kind so sibling lookups (HPA, PDB)
/// stay cheap.
#[derive(Debug, Clone)]
pub struct ResourceProvider {
    pub server_version: String,
    pub source_name: String,
    pub source_type: SourceType,
    pub creation_time: DateTime<Utc>,
    pub namespaces: Vec<String>,
    pub resources: BTreeMap<String, Vec<GenericResource>>,
}

impl ResourceProvider {
    fn empty(source_type: SourceType, source_name: &str) -> ResourceProvider {
        ResourceProvider {
            server_version: "unknown".to_string(),
            source_name: source_name.to_string(),
            source_type,
            creation_time: Utc::now(),
            namespaces: Vec::new(),
            resources: BTreeMap::new(),
        }
    }

    /// Walks a file or directory of manifests. Files that fail to parse are
    /// logged and skipped so one bad manifest cannot sink a directory audit.
    pub fn from_path(path: &Path) -> Result<ResourceProvider, ResourceError> {
        let mut provider = ResourceProvider::empty(SourceType::Path, &path.display().to_string());
        for entry in WalkDir::new(path).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable path entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();
            if ext != "yaml" && ext != "yml" {
                continue;
            }
            let raw = match std::fs::read_to_string(entry.path()) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            for doc in split_documents(&raw) {
                match GenericResource::from_yaml(doc) {
                    Ok(resource) => provider.add(resource),
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "skipping invalid document");
                    }
                }
            }
        }
        Ok(provider)
    }

    /// Parses in-memory manifest content. Unlike `from_path`, a document
    /// that fails to parse is an error.
    pub fn from_yaml(raw: &str) -> Result<ResourceProvider, ResourceError> {
        let mut provider = ResourceProvider::empty(SourceType::Content, "Content");
        for doc in split_documents(raw) {
            provider.add(GenericResource::from_yaml(doc)?);
        }
        Ok(provider)
    }

    pub fn from_resource(resource: GenericResource) -> ResourceProvider {
        let mut provider = ResourceProvider::empty(SourceType::Content, "Content");
        provider.add(resource);
        provider
    }

    pub fn add(&mut self, resource: GenericResource) {
        let namespace = resource.namespace();
        if !namespace.is_empty() && !self.namespaces.iter().any(|n| n == namespace) {
            self.namespaces.push(namespace.to_string());
        }
        self.resources
            .entry(resource.group_kind_key())
            .or_default()
            .push(resource);
    }

    pub fn lookup(&self, kind_key: &str) -> &[GenericResource] {
        self.resources.get(kind_key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all(&self) -> impl Iterator<Item = &GenericResource> {
        self.resources.values().flatten()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }
}

/// Splits multi-document YAML on `---` separator lines. Whitespace-only
/// documents are dropped.
pub fn split_documents(raw: &str) -> Vec<&str> {
    let mut docs = Vec::new();
    let mut start = 0;
    for (offset, line) in line_spans(raw) {
        if line.trim_end() == "---" {
            let doc = &raw[start..offset];
            if !doc.trim().is_empty() {
                docs.push(doc);
            }
            start = offset + line.len();
        }
    }
    let tail = &raw[start..];
    if !tail.trim().is_empty() {
        docs.push(tail);
    }
    docs
}

fn line_spans(raw: &str) -> impl Iterator<Item = (usize, &str)> {
    raw.split_inclusive('\n').scan(0, |offset, line| {
        let start = *offset;
        *offset += line.len();
        Some((start, line))
    })
}
