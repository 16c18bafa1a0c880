use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::resources::{GenericResource, ResourceProvider};

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("unknown validator {0}")]
    Unknown(String),
}

/// One resource under evaluation plus the rest of the audit, so validators
/// can inspect sibling resources.
pub struct SchemaTestCase<'a> {
    pub resource: &'a GenericResource,
    pub provider: &'a ResourceProvider,
}

pub type ValidatorFn = fn(&SchemaTestCase) -> (bool, Vec<String>);

/// Named validators referenced by checks through `additionalValidators`.
/// The registry is built once and injected into the engine; it is never a
/// process-wide mutable.
pub struct ValidatorRegistry {
    validators: BTreeMap<&'static str, ValidatorFn>,
}

impl Default for ValidatorRegistry {
    fn default() -> ValidatorRegistry {
        let mut validators: BTreeMap<&'static str, ValidatorFn> = BTreeMap::new();
        validators.insert("hpaMaxAvailability", hpa_max_availability);
        validators.insert(
            "pdbMinAvailableGreaterThanHPAMinReplicas",
            pdb_min_available_greater_than_hpa_min_replicas,
        );
        validators.insert("hasPodDisruptionBudget", has_pod_disruption_budget);
        ValidatorRegistry { validators }
    }
}

impl ValidatorRegistry {
    pub fn run(
        &self,
        name: &str,
        test: &SchemaTestCase,
    ) -> Result<(bool, Vec<String>), ValidatorError> {
        let validator = self
            .validators
            .get(name)
            .ok_or_else(|| ValidatorError::Unknown(name.to_string()))?;
        Ok(validator(test))
    }
}

fn hpa_max_availability(test: &SchemaTestCase) -> (bool, Vec<String>) {
    let spec = &test.resource.resource["spec"];
    let Some(min_replicas) = spec["minReplicas"].as_i64() else {
        return (true, Vec::new());
    };
    let max_replicas = spec["maxReplicas"].as_i64().unwrap_or(0);
    // Only the degenerate max == min case pins availability; max < min is
    // rejected by the API server itself.
    if max_replicas != min_replicas {
        return (true, Vec::new());
    }
    (
        false,
        vec![format!(
            "maxReplicas ({max_replicas}) and minReplicas ({min_replicas}) should be different"
        )],
    )
}

fn pdb_min_available_greater_than_hpa_min_replicas(test: &SchemaTestCase) -> (bool, Vec<String>) {
    let deployment = test.resource;
    let Some(pdb) = attached_pdb(deployment, test.provider) else {
        return (true, Vec::new());
    };
    let Some(hpa) = attached_hpa(deployment, test.provider) else {
        return (true, Vec::new());
    };
    let Some(min_replicas) = hpa.resource["spec"]["minReplicas"].as_i64() else {
        return (true, Vec::new());
    };
    let min_available = match scaled_int_or_percent(&pdb.resource["spec"]["minAvailable"], min_replicas) {
        Ok(Some(v)) => v,
        Ok(None) => return (true, Vec::new()),
        Err(reason) => {
            warn!(pdb = pdb.name(), reason, "could not read minAvailable");
            return (true, Vec::new());
        }
    };
    if min_available > min_replicas {
        return (
            false,
            vec![format!(
                "The minAvailable value in the PodDisruptionBudget({}) is {min_available}, \
                 which is greater than the minReplicas value in the HorizontalPodAutoscaler({}) ({min_replicas})",
                pdb.name(),
                hpa.name()
            )],
        );
    }
    (true, Vec::new())
}

fn has_pod_disruption_budget(test: &SchemaTestCase) -> (bool, Vec<String>) {
    if attached_pdb(test.resource, test.provider).is_some() {
        (true, Vec::new())
    } else {
        (
            false,
            vec![format!(
                "no PodDisruptionBudget selects the pods of {} {}",
                test.resource.kind,
                test.resource.name()
            )],
        )
    }
}

/// A PDB is attached when any of its selector matchLabels pairs appears in
/// the workload's pod template labels. The lookup is namespace-scoped.
fn attached_pdb<'a>(
    workload: &GenericResource,
    provider: &'a ResourceProvider,
) -> Option<&'a GenericResource> {
    let template_labels = workload
        .pod_template
        .as_ref()
        .and_then(|t| t["metadata"]["labels"].as_object())?;
    provider
        .lookup("policy/PodDisruptionBudget")
        .iter()
        .filter(|pdb| pdb.namespace() == workload.namespace())
        .find(|pdb| {
            pdb.resource["spec"]["selector"]["matchLabels"]
                .as_object()
                .is_some_and(|labels| {
                    labels
                        .iter()
                        .any(|(key, value)| template_labels.get(key) == Some(value))
                })
        })
}

fn attached_hpa<'a>(
    workload: &GenericResource,
    provider: &'a ResourceProvider,
) -> Option<&'a GenericResource> {
    provider
        .lookup("autoscaling/HorizontalPodAutoscaler")
        .iter()
        .filter(|hpa| hpa.namespace() == workload.namespace())
        .find(|hpa| {
            let target = &hpa.resource["spec"]["scaleTargetRef"];
            target["kind"].as_str() == Some(workload.kind.as_str())
                && target["name"].as_str() == Some(workload.name())
        })
}

/// Resolves an IntOrString field. Percentages scale against `total`,
/// rounding up.
fn scaled_int_or_percent(value: &Value, total: i64) -> Result<Option<i64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| format!("{n} is not an integer")),
        Value::String(s) => {
            let percent_str = s
                .strip_suffix('%')
                .ok_or_else(|| format!("string value {s:?} is not a percentage"))?;
            let percent: i64 = percent_str
                .trim()
                .parse()
                .map_err(|e| format!("invalid percentage {s:?}: {e}"))?;
            Ok(Some((percent * total + 99) / 100))
        }
        other => Err(format!("unexpected value {other}")),
    }
}
