use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::SchemaCheck;

pub const EXEMPTION_ANNOTATION_KEY: &str = "polaris.fairwinds.com/exempt";
pub const EXEMPTION_ANNOTATION_DOMAIN: &str = "polaris.fairwinds.com";

const DEFAULT_CONFIG: &str = include_str!("../checks/config.yaml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(
        "no severity specified for custom check {0}; add it under `checks` as ignore, warning, or danger"
    )]
    CustomCheckWithoutSeverity(String),
    #[error("custom check {id} is invalid: {reason}")]
    InvalidCustomCheck { id: String, reason: String },
}

/// The action taken when a check fails. `error` is accepted as a historical
/// synonym for `danger`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Ignore,
    Warning,
    #[serde(alias = "error")]
    Danger,
}

impl Severity {
    pub fn is_actionable(self) -> bool {
        matches!(self, Severity::Warning | Severity::Danger)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Ignore => "ignore",
            Severity::Warning => "warning",
            Severity::Danger => "danger",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Exemption {
    pub rules: Vec<String>,
    pub controller_names: Vec<String>,
    pub container_names: Vec<String>,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    pub display_name: String,
    pub checks: BTreeMap<String, Severity>,
    pub custom_checks: BTreeMap<String, SchemaCheck>,
    pub exemptions: Vec<Exemption>,
    pub disallow_exemptions: bool,
    pub disallow_config_exemptions: bool,
    pub disallow_annotation_exemptions: bool,
    /// When set, exemption controllerNames/containerNames match by equality
    /// instead of the default prefix match.
    pub exemptions_match_exactly: bool,
    pub controllers_to_scan: Vec<String>,
    pub mutations: Vec<String>,
    /// When set, only resources in this namespace are audited.
    pub namespace: String,
}

impl Configuration {
    /// The embedded default configuration, with every built-in check enabled
    /// at its default severity.
    pub fn default_config() -> Result<Configuration, ConfigError> {
        Configuration::parse(DEFAULT_CONFIG.as_bytes())
    }

    /// Loads configuration from a file, deep-merging it over the embedded
    /// defaults. With no path, the defaults are used as-is.
    pub fn load(path: Option<&Path>) -> Result<Configuration, ConfigError> {
        let Some(path) = path else {
            return Configuration::default_config();
        };
        let raw = std::fs::read(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;
        let merged = merge_yaml(DEFAULT_CONFIG.as_bytes(), &raw)?;
        Configuration::parse(&merged)
    }

    /// Parses configuration from raw YAML or JSON bytes.
    pub fn parse(raw: &[u8]) -> Result<Configuration, ConfigError> {
        let mut conf: Configuration = serde_yaml::from_slice(raw)?;
        let custom_ids: Vec<String> = conf.custom_checks.keys().cloned().collect();
        for id in custom_ids {
            let mut check = conf.custom_checks.remove(&id).unwrap_or_default();
            check
                .initialize(&id)
                .map_err(|e| ConfigError::InvalidCustomCheck {
                    id: id.clone(),
                    reason: e.to_string(),
                })?;
            if !conf.checks.contains_key(&id) {
                return Err(ConfigError::CustomCheckWithoutSeverity(id));
            }
            conf.custom_checks.insert(id, check);
        }
        Ok(conf)
    }

    pub fn severity(&self, check_id: &str) -> Severity {
        self.checks.get(check_id).copied().unwrap_or_default()
    }

    /// Decides whether a check should run for a resource, taking configured
    /// severity and config-level exemptions into account.
    pub fn is_actionable(
        &self,
        check_id: &str,
        object_meta: &ObjectMeta,
        container_name: &str,
    ) -> bool {
        if !self.severity(check_id).is_actionable() {
            return false;
        }
        if self.disallow_exemptions || self.disallow_config_exemptions {
            return true;
        }
        let namespace = object_meta.namespace.as_deref().unwrap_or("");
        let controller_name = object_meta.name.as_deref().unwrap_or("");
        for exemption in &self.exemptions {
            if !exemption.namespace.is_empty() && exemption.namespace != namespace {
                continue;
            }
            let rule_matches = exemption.rules.iter().any(|r| r == check_id);
            if !exemption.rules.is_empty() && !rule_matches {
                continue;
            }
            if !self.name_filter_matches(&exemption.controller_names, controller_name) {
                continue;
            }
            // A matching containerNames filter narrows the suppression to the
            // named containers; an empty filter suppresses unconditionally.
            if self.name_filter_matches(&exemption.container_names, container_name) {
                return false;
            }
        }
        true
    }

    /// Decides whether a resource's annotations exempt it from a check.
    pub fn has_exemption_annotation(&self, object_meta: &ObjectMeta, check_id: &str) -> bool {
        if self.disallow_exemptions || self.disallow_annotation_exemptions {
            return false;
        }
        let Some(annotations) = &object_meta.annotations else {
            return false;
        };
        if annotations
            .get(EXEMPTION_ANNOTATION_KEY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            return true;
        }
        let key = format!(
            "{EXEMPTION_ANNOTATION_DOMAIN}/{}-exempt",
            kebab_case(check_id)
        );
        annotations
            .get(&key)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    fn name_filter_matches(&self, filter: &[String], name: &str) -> bool {
        if filter.is_empty() {
            return true;
        }
        filter.iter().any(|entry| {
            if self.exemptions_match_exactly {
                name == entry
            } else {
                name.starts_with(entry.as_str())
            }
        })
    }
}

/// Converts a camelCase check ID to its kebab-case annotation form,
/// e.g. `hostPortSet` becomes `host-port-set`.
pub fn kebab_case(id: &str) -> String {
    let mut out = String::with_capacity(id.len() + 4);
    for c in id.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Deep-merges two YAML documents. Maps merge recursively; any other
/// overriding value replaces the default wholesale.
pub fn merge_yaml(defaults: &[u8], overrides: &[u8]) -> Result<Vec<u8>, ConfigError> {
    let default_value: serde_yaml::Value = serde_yaml::from_slice(defaults)?;
    let override_value: serde_yaml::Value = serde_yaml::from_slice(overrides)?;
    let merged = merge_values(default_value, override_value);
    let out = serde_yaml::to_string(&merged)?;
    Ok(out.into_bytes())
}

fn merge_values(defaults: serde_yaml::Value, overrides: serde_yaml::Value) -> serde_yaml::Value {
    match (defaults, overrides) {
        (serde_yaml::Value::Mapping(mut base), serde_yaml::Value::Mapping(over)) => {
            for (key, value) in over {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            serde_yaml::Value::Mapping(base)
        }
        (_, overrides) => overrides,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, namespace: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    fn config_with_exemption(exemption: Exemption) -> Configuration {
        let mut conf = Configuration::default();
        conf.checks.insert("hostPortSet".to_string(), Severity::Danger);
        conf.checks.insert("hostIPCSet".to_string(), Severity::Danger);
        conf.exemptions.push(exemption);
        conf
    }

    #[test]
    fn test_severity_parsing() {
        let conf: Configuration =
            serde_yaml::from_str("checks:\n  a: danger\n  b: error\n  c: warning\n  d: ignore\n")
                .unwrap();
        assert_eq!(conf.severity("a"), Severity::Danger);
        assert_eq!(conf.severity("b"), Severity::Danger);
        assert_eq!(conf.severity("c"), Severity::Warning);
        assert_eq!(conf.severity("d"), Severity::Ignore);
        assert_eq!(conf.severity("unknown"), Severity::Ignore);
    }

    #[test]
    fn test_ignore_is_not_actionable() {
        let mut conf = Configuration::default();
        conf.checks.insert("hostPortSet".to_string(), Severity::Ignore);
        assert!(!conf.is_actionable("hostPortSet", &meta("web", "default"), ""));
    }

    #[test]
    fn test_exemption_controller_prefix_match() {
        let conf = config_with_exemption(Exemption {
            rules: vec![],
            controller_names: vec!["foo".to_string()],
            container_names: vec![],
            namespace: String::new(),
        });
        assert!(!conf.is_actionable("hostPortSet", &meta("foo-abc123", "default"), ""));
        assert!(conf.is_actionable("hostPortSet", &meta("bar", "default"), ""));
    }

    #[test]
    fn test_exemption_exact_match_mode() {
        let mut conf = config_with_exemption(Exemption {
            rules: vec![],
            controller_names: vec!["foo".to_string()],
            container_names: vec![],
            namespace: String::new(),
        });
        conf.exemptions_match_exactly = true;
        assert!(conf.is_actionable("hostPortSet", &meta("foo-abc123", "default"), ""));
        assert!(!conf.is_actionable("hostPortSet", &meta("foo", "default"), ""));
    }

    #[test]
    fn test_exemption_rule_filter() {
        let conf = config_with_exemption(Exemption {
            rules: vec!["hostPortSet".to_string()],
            controller_names: vec!["web".to_string()],
            container_names: vec![],
            namespace: String::new(),
        });
        assert!(!conf.is_actionable("hostPortSet", &meta("web", "default"), ""));
        assert!(conf.is_actionable("hostIPCSet", &meta("web", "default"), ""));
    }

    #[test]
    fn test_exemption_namespace_filter() {
        let conf = config_with_exemption(Exemption {
            rules: vec![],
            controller_names: vec![],
            container_names: vec![],
            namespace: "kube-system".to_string(),
        });
        assert!(!conf.is_actionable("hostPortSet", &meta("web", "kube-system"), ""));
        assert!(conf.is_actionable("hostPortSet", &meta("web", "default"), ""));
    }

    #[test]
    fn test_exemption_container_names_narrow_suppression() {
        let conf = config_with_exemption(Exemption {
            rules: vec![],
            controller_names: vec!["web".to_string()],
            container_names: vec!["sidecar".to_string()],
            namespace: String::new(),
        });
        assert!(!conf.is_actionable("hostPortSet", &meta("web", "default"), "sidecar"));
        assert!(!conf.is_actionable("hostPortSet", &meta("web", "default"), "sidecar-proxy"));
        assert!(conf.is_actionable("hostPortSet", &meta("web", "default"), "app"));
    }

    #[test]
    fn test_disallow_config_exemptions() {
        let mut conf = config_with_exemption(Exemption {
            rules: vec![],
            controller_names: vec!["web".to_string()],
            container_names: vec![],
            namespace: String::new(),
        });
        conf.disallow_config_exemptions = true;
        assert!(conf.is_actionable("hostPortSet", &meta("web", "default"), ""));
    }

    #[test]
    fn test_annotation_exemption() {
        let mut conf = Configuration::default();
        conf.checks.insert("hostPortSet".to_string(), Severity::Danger);

        let mut m = meta("web", "default");
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "polaris.fairwinds.com/host-port-set-exempt".to_string(),
            "TRUE".to_string(),
        );
        m.annotations = Some(annotations);
        assert!(conf.has_exemption_annotation(&m, "hostPortSet"));
        assert!(!conf.has_exemption_annotation(&m, "hostIPCSet"));

        conf.disallow_annotation_exemptions = true;
        assert!(!conf.has_exemption_annotation(&m, "hostPortSet"));
    }

    #[test]
    fn test_annotation_exemption_all_rules() {
        let conf = Configuration::default();
        let mut m = meta("web", "default");
        let mut annotations = BTreeMap::new();
        annotations.insert(EXEMPTION_ANNOTATION_KEY.to_string(), "true".to_string());
        m.annotations = Some(annotations);
        assert!(conf.has_exemption_annotation(&m, "anything"));

        m.annotations
            .as_mut()
            .unwrap()
            .insert(EXEMPTION_ANNOTATION_KEY.to_string(), "false".to_string());
        assert!(!conf.has_exemption_annotation(&m, "anything"));
    }

    #[test]
    fn test_kebab_case() {
        assert_eq!(kebab_case("hostPortSet"), "host-port-set");
        assert_eq!(kebab_case("tagNotSpecified"), "tag-not-specified");
        assert_eq!(kebab_case("simple"), "simple");
    }

    #[test]
    fn test_merge_yaml_deep() {
        let defaults =
            b"checks:\n  hostPortSet: warning\n  hostIPCSet: danger\ndisplayName: default\n";
        let overrides = b"checks:\n  hostPortSet: ignore\ndisplayName: mine\n";
        let merged = merge_yaml(defaults, overrides).unwrap();
        let conf = Configuration::parse(&merged).unwrap();
        assert_eq!(conf.severity("hostPortSet"), Severity::Ignore);
        assert_eq!(conf.severity("hostIPCSet"), Severity::Danger);
        assert_eq!(conf.display_name, "mine");
    }

    #[test]
    fn test_merge_yaml_right_biased_on_leaves() {
        let merged = merge_yaml(b"a: 1\nb: 2\n", b"b: 3\nc: 4\n").unwrap();
        let value: serde_yaml::Value = serde_yaml::from_slice(&merged).unwrap();
        assert_eq!(value["a"], serde_yaml::Value::from(1));
        assert_eq!(value["b"], serde_yaml::Value::from(3));
        assert_eq!(value["c"], serde_yaml::Value::from(4));
    }

    #[test]
    fn test_parse_json_config() {
        let conf = Configuration::parse(br#"{"checks": {"hostPortSet": "danger"}}"#).unwrap();
        assert_eq!(conf.severity("hostPortSet"), Severity::Danger);
    }

    #[test]
    fn test_custom_check_requires_severity() {
        let raw = br#"
customChecks:
  myCheck:
    successMessage: ok
    failureMessage: bad
    category: Security
    target: Container
    schema:
      type: object
"#;
        assert!(matches!(
            Configuration::parse(raw),
            Err(ConfigError::CustomCheckWithoutSeverity(_))
        ));
    }

    #[test]
    fn test_default_config_parses() {
        let conf = Configuration::default_config().unwrap();
        assert!(!conf.checks.is_empty());
        assert_eq!(conf.severity("hostIPCSet"), Severity::Danger);
    }
}
