use std::collections::BTreeMap;

use thiserror::Error;

use crate::schema::{SchemaCheck, SchemaError};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("built-in check {id} is not valid YAML: {source}")]
    Parse {
        id: &'static str,
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Built-in checks embedded at compile time, in fixed catalog order.
pub const BUILTIN_CHECKS: [(&str, &str); 27] = [
    (
        "multipleReplicasForDeployment",
        include_str!("../checks/multipleReplicasForDeployment.yaml"),
    ),
    ("hostIPCSet", include_str!("../checks/hostIPCSet.yaml")),
    ("hostPIDSet", include_str!("../checks/hostPIDSet.yaml")),
    ("hostNetworkSet", include_str!("../checks/hostNetworkSet.yaml")),
    (
        "automountServiceAccountToken",
        include_str!("../checks/automountServiceAccountToken.yaml"),
    ),
    ("memoryLimitsMissing", include_str!("../checks/memoryLimitsMissing.yaml")),
    (
        "memoryRequestsMissing",
        include_str!("../checks/memoryRequestsMissing.yaml"),
    ),
    ("cpuLimitsMissing", include_str!("../checks/cpuLimitsMissing.yaml")),
    ("cpuRequestsMissing", include_str!("../checks/cpuRequestsMissing.yaml")),
    (
        "readinessProbeMissing",
        include_str!("../checks/readinessProbeMissing.yaml"),
    ),
    (
        "livenessProbeMissing",
        include_str!("../checks/livenessProbeMissing.yaml"),
    ),
    ("pullPolicyNotAlways", include_str!("../checks/pullPolicyNotAlways.yaml")),
    ("tagNotSpecified", include_str!("../checks/tagNotSpecified.yaml")),
    ("hostPortSet", include_str!("../checks/hostPortSet.yaml")),
    ("runAsRootAllowed", include_str!("../checks/runAsRootAllowed.yaml")),
    ("runAsPrivileged", include_str!("../checks/runAsPrivileged.yaml")),
    (
        "notReadOnlyRootFilesystem",
        include_str!("../checks/notReadOnlyRootFilesystem.yaml"),
    ),
    (
        "privilegeEscalationAllowed",
        include_str!("../checks/privilegeEscalationAllowed.yaml"),
    ),
    (
        "dangerousCapabilities",
        include_str!("../checks/dangerousCapabilities.yaml"),
    ),
    (
        "insecureCapabilities",
        include_str!("../checks/insecureCapabilities.yaml"),
    ),
    ("priorityClassNotSet", include_str!("../checks/priorityClassNotSet.yaml")),
    ("tlsSettingsMissing", include_str!("../checks/tlsSettingsMissing.yaml")),
    ("pdbDisruptionsIsZero", include_str!("../checks/pdbDisruptionsIsZero.yaml")),
    (
        "metadataAndNameMismatched",
        include_str!("../checks/metadataAndNameMismatched.yaml"),
    ),
    (
        "missingPodDisruptionBudget",
        include_str!("../checks/missingPodDisruptionBudget.yaml"),
    ),
    ("hpaMaxAvailability", include_str!("../checks/hpaMaxAvailability.yaml")),
    (
        "pdbMinAvailableGreaterThanHPAMinReplicas",
        include_str!("../checks/pdbMinAvailableGreaterThanHPAMinReplicas.yaml"),
    ),
];

/// Parses and initializes every embedded check. Any malformed file is fatal;
/// a partial catalog is never returned.
pub fn builtin_checks() -> Result<BTreeMap<String, SchemaCheck>, CatalogError> {
    let mut catalog = BTreeMap::new();
    for (id, raw) in BUILTIN_CHECKS {
        let mut check: SchemaCheck =
            serde_yaml::from_str(raw).map_err(|source| CatalogError::Parse { id, source })?;
        check.initialize(id)?;
        catalog.insert(id.to_string(), check);
    }
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TargetKind;

    #[test]
    fn test_catalog_loads() {
        let catalog = builtin_checks().unwrap();
        assert_eq!(catalog.len(), BUILTIN_CHECKS.len());
        for (id, check) in &catalog {
            assert_eq!(&check.id, id);
            assert!(!check.category.is_empty());
            assert!(!check.success_message.is_empty());
            assert!(!check.failure_message.is_empty());
        }
    }

    #[test]
    fn test_catalog_targets() {
        let catalog = builtin_checks().unwrap();
        assert_eq!(catalog["hostIPCSet"].target, TargetKind::PodSpec);
        assert_eq!(catalog["cpuRequestsMissing"].target, TargetKind::Container);
        assert_eq!(
            catalog["tlsSettingsMissing"].target,
            TargetKind::Kind("networking.k8s.io/Ingress".to_string())
        );
        assert!(catalog["runAsRootAllowed"].is_templated());
        assert!(catalog["metadataAndNameMismatched"].is_templated());
    }

    #[test]
    fn test_catalog_ids_match_default_config() {
        let catalog = builtin_checks().unwrap();
        let config = crate::config::Configuration::default_config().unwrap();
        for id in catalog.keys() {
            assert!(config.checks.contains_key(id), "no default severity for {id}");
        }
        for id in config.checks.keys() {
            assert!(catalog.contains_key(id), "no built-in check for {id}");
        }
    }
}
