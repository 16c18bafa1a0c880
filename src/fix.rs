use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::engine::CheckEngine;
use crate::mutation;
use crate::resources::{GenericResource, ResourceError, ResourceProvider, split_documents};

#[derive(Debug, Error)]
pub enum FixError {
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    FileWrite {
        path: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Rewrites manifests under `files_path` in place, applying the mutations of
/// every failing rule allow-listed in the configuration. With `is_template`,
/// Helm template markers are lifted before parsing and restored afterwards.
pub fn execute(engine: &CheckEngine, files_path: &Path, is_template: bool) -> Result<(), FixError> {
    for file in yaml_files(files_path) {
        let content = std::fs::read_to_string(&file).map_err(|source| FixError::FileRead {
            path: file.clone(),
            source,
        })?;
        let (fixed, changed) = fix_content(engine, &content, is_template)?;
        if changed {
            info!(path = %file, "writing fixed manifest");
            std::fs::write(&file, fixed).map_err(|source| FixError::FileWrite {
                path: file.clone(),
                source,
            })?;
        }
    }
    Ok(())
}

fn yaml_files(path: &Path) -> Vec<String> {
    if path.is_file() {
        return vec![path.display().to_string()];
    }
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            matches!(
                entry.path().extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .map(|entry| entry.path().display().to_string())
        .collect()
}

/// Fixes a single file's content. Documents with nothing to mutate are kept
/// verbatim; a mutation failure abandons that resource only.
pub fn fix_content(
    engine: &CheckEngine,
    content: &str,
    is_template: bool,
) -> Result<(String, bool), FixError> {
    let (plain, directives) = if is_template {
        let (plain, directives) = mutation::detemplate(content);
        (plain, Some(directives))
    } else {
        (content.to_string(), None)
    };

    // The whole file backs sibling lookups even when only one document
    // mutates.
    let provider = ResourceProvider::from_yaml(&plain)?;

    let mut parts = Vec::new();
    let mut changed = false;
    for doc in split_documents(&plain) {
        match fix_document(engine, &provider, doc) {
            Some(fixed) => {
                parts.push(fixed);
                changed = true;
            }
            None => parts.push(normalize_document(doc)),
        }
    }

    // A separator before the first document is not captured by the split.
    let leading_separator = plain
        .lines()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| line.trim_end() == "---");

    let mut fixed = parts.join("---\n");
    if leading_separator {
        fixed.insert_str(0, "---\n");
    }
    if let Some(directives) = &directives {
        fixed = mutation::retemplate(&fixed, directives);
    }
    Ok((fixed, changed))
}

fn fix_document(engine: &CheckEngine, provider: &ResourceProvider, doc: &str) -> Option<String> {
    let resource = match GenericResource::from_yaml(doc) {
        Ok(resource) => resource,
        Err(e) => {
            warn!(error = %e, "document is not a resource, leaving it unchanged");
            return None;
        }
    };
    let result = engine.apply_all_checks(provider, &resource);
    let (mutations, comments) = mutation::collect_mutations(&result);
    if mutations.is_empty() {
        return None;
    }
    let mutated = match mutation::apply_mutations(&resource.resource, &mutations) {
        Ok(mutated) => mutated,
        Err(e) => {
            warn!(
                kind = %resource.kind,
                name = %resource.name(),
                error = %e,
                "mutation failed, leaving resource unchanged"
            );
            return None;
        }
    };
    let emitted = match mutation::to_yaml(&mutated) {
        Ok(emitted) => emitted,
        Err(e) => {
            warn!(error = %e, "could not re-emit mutated resource");
            return None;
        }
    };
    Some(mutation::inject_comments(&emitted, &comments))
}

// Verbatim documents still need a trailing newline so separators land on
// their own lines when the file is reassembled.
fn normalize_document(doc: &str) -> String {
    let mut out = doc.to_string();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    fn engine(config_yaml: &str) -> CheckEngine {
        let config = Configuration::parse(config_yaml.as_bytes()).unwrap();
        CheckEngine::new(config).unwrap()
    }

    const PULL_POLICY_CONFIG: &str =
        "checks:\n  pullPolicyNotAlways: warning\nmutations:\n  - pullPolicyNotAlways\n";

    const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  template:
    spec:
      containers:
        - name: app
          image: nginx:1.27
          imagePullPolicy: IfNotPresent
"#;

    #[test]
    fn test_fix_rewrites_pull_policy() {
        let engine = engine(PULL_POLICY_CONFIG);
        let (fixed, changed) = fix_content(&engine, DEPLOYMENT, false).unwrap();
        assert!(changed);
        assert!(fixed.contains("imagePullPolicy: Always"));
        assert!(!fixed.contains("IfNotPresent"));

        // the fixed manifest audits clean
        let provider = ResourceProvider::from_yaml(&fixed).unwrap();
        let audit = engine.run_audit(&provider);
        let container =
            &audit.results[0].pod_result.as_ref().unwrap().container_results[0];
        assert!(container.results["pullPolicyNotAlways"].success);
    }

    #[test]
    fn test_fix_keeps_leading_separator() {
        let engine = engine(PULL_POLICY_CONFIG);
        let content = format!("---\n{DEPLOYMENT}");
        let (fixed, changed) = fix_content(&engine, &content, false).unwrap();
        assert!(changed);
        assert!(fixed.starts_with("---\n"));
        assert!(fixed.contains("imagePullPolicy: Always"));
    }

    #[test]
    fn test_fix_is_idempotent() {
        let engine = engine(PULL_POLICY_CONFIG);
        let (fixed, _) = fix_content(&engine, DEPLOYMENT, false).unwrap();
        let (fixed_again, changed) = fix_content(&engine, &fixed, false).unwrap();
        assert!(!changed);
        assert_eq!(fixed, fixed_again);
    }

    #[test]
    fn test_unmutated_documents_kept_verbatim() {
        let engine = engine(PULL_POLICY_CONFIG);
        let service = "apiVersion: v1\nkind: Service\nmetadata:\n  # keep me\n  name: s\n";
        let content = format!("{service}---\n{DEPLOYMENT}");
        let (fixed, changed) = fix_content(&engine, &content, false).unwrap();
        assert!(changed);
        assert!(fixed.contains("# keep me"));
        assert!(fixed.contains("imagePullPolicy: Always"));
    }

    #[test]
    fn test_fix_preserves_key_order() {
        let engine = engine(PULL_POLICY_CONFIG);
        let (fixed, _) = fix_content(&engine, DEPLOYMENT, false).unwrap();
        let api_pos = fixed.find("apiVersion").unwrap();
        let kind_pos = fixed.find("kind:").unwrap();
        let meta_pos = fixed.find("metadata:").unwrap();
        assert!(api_pos < kind_pos && kind_pos < meta_pos);
    }

    #[test]
    fn test_fix_templated_manifest() {
        let engine = engine(PULL_POLICY_CONFIG);
        let templated = format!("{{{{- if .Values.enabled }}}}\n{DEPLOYMENT}{{{{- end }}}}\n");
        let (fixed, changed) = fix_content(&engine, &templated, true).unwrap();
        assert!(changed);
        assert!(fixed.contains("{{- if .Values.enabled }}"));
        assert!(fixed.contains("{{- end }}"));
        assert!(fixed.contains("imagePullPolicy: Always"));
    }

    #[test]
    fn test_fix_adds_missing_resources() {
        let engine = engine(
            "checks:\n  cpuRequestsMissing: warning\nmutations:\n  - cpuRequestsMissing\n",
        );
        let (fixed, changed) = fix_content(&engine, DEPLOYMENT, false).unwrap();
        assert!(changed);
        assert!(fixed.contains("cpu: 100m"));
    }
}
