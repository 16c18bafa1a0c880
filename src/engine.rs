use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::checks::{CatalogError, builtin_checks};
use crate::config::Configuration;
use crate::output::{
    AuditData, ClusterInfo, ContainerResult, PodResult, ResourceResult, ResultMessage,
};
use crate::resources::{GenericResource, ResourceProvider};
use crate::schema::{Mutation, SchemaCheck, TargetKind};
use crate::validators::{SchemaTestCase, ValidatorRegistry};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Where a message was produced, which decides the JSON pointer prefix any
/// attached mutations need.
enum Scope {
    Resource,
    PodSpec,
    Container { index: usize, is_init: bool },
}

/// The evaluation pipeline. Immutable once built, so a single engine can
/// serve concurrent admission requests.
pub struct CheckEngine {
    config: Configuration,
    catalog: BTreeMap<String, SchemaCheck>,
    validators: ValidatorRegistry,
}

impl CheckEngine {
    pub fn new(config: Configuration) -> Result<CheckEngine, EngineError> {
        let mut catalog = builtin_checks()?;
        for (id, check) in &config.custom_checks {
            catalog.insert(id.clone(), check.clone());
        }
        Ok(CheckEngine {
            config,
            catalog,
            validators: ValidatorRegistry::default(),
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Audits every resource the provider holds. Results are ordered by
    /// namespace, kind, then name; resources no rule applied to are dropped.
    pub fn run_audit(&self, provider: &ResourceProvider) -> AuditData {
        let mut results: Vec<ResourceResult> = provider
            .all()
            .filter(|resource| {
                self.config.namespace.is_empty() || resource.namespace() == self.config.namespace
            })
            .map(|resource| self.apply_all_checks(provider, resource))
            .filter(|result| {
                !result.results.is_empty()
                    || result
                        .pod_result
                        .as_ref()
                        .is_some_and(|p| !p.results.is_empty() || !p.container_results.is_empty())
            })
            .collect();
        results.sort_by(|a, b| {
            (&a.namespace, &a.kind, &a.name).cmp(&(&b.namespace, &b.kind, &b.name))
        });

        let cluster_info = ClusterInfo {
            version: provider.server_version.clone(),
            nodes: 0,
            pods: provider.lookup("Pod").len(),
            namespaces: provider.namespaces.len(),
            controllers: provider.all().filter(|r| r.pod_spec.is_some()).count(),
        };
        AuditData::new(
            provider.source_type.as_str(),
            &provider.source_name,
            &self.config.display_name,
            cluster_info,
            results,
        )
    }

    /// Applies every configured rule to one resource. Single-rule failures
    /// are logged and skipped; this never aborts the resource.
    pub fn apply_all_checks(
        &self,
        provider: &ResourceProvider,
        resource: &GenericResource,
    ) -> ResourceResult {
        let mut result = ResourceResult {
            name: resource.name().to_string(),
            namespace: resource.namespace().to_string(),
            kind: resource.kind.clone(),
            created_time: resource.creation_time(),
            ..Default::default()
        };
        let mut pod_result = PodResult::default();
        let containers = resource
            .pod_spec
            .as_ref()
            .map(container_entries)
            .unwrap_or_default();
        let mut container_results: Vec<ContainerResult> = containers
            .iter()
            .map(|(_, _, container)| ContainerResult {
                name: container["name"].as_str().unwrap_or_default().to_string(),
                results: Default::default(),
            })
            .collect();
        let scan_workload = self.config.controllers_to_scan.is_empty()
            || self.config.controllers_to_scan.contains(&resource.kind);

        // BTreeMap iteration keeps rule order lexicographic by ID.
        for check_id in self.config.checks.keys() {
            let Some(check) = self.catalog.get(check_id) else {
                debug!(check = %check_id, "no such check, skipping");
                continue;
            };

            if check.is_actionable(&TargetKind::Controller, &resource.kind, false) {
                if let Some(message) =
                    self.run_check(check, provider, resource, &resource.resource, &Scope::Resource)
                {
                    result.results.insert(check_id.clone(), message);
                }
            }

            let Some(pod_spec) = resource.pod_spec.as_ref().filter(|_| scan_workload) else {
                continue;
            };

            if check.is_actionable(&TargetKind::PodSpec, &resource.kind, false) {
                let object = if check.target == TargetKind::PodTemplate {
                    resource.pod_template.as_ref().unwrap_or(pod_spec)
                } else {
                    pod_spec
                };
                if let Some(message) =
                    self.run_check(check, provider, resource, object, &Scope::PodSpec)
                {
                    pod_result.results.insert(check_id.clone(), message);
                }
            }

            for (slot, (is_init, index, container)) in containers.iter().enumerate() {
                if !check.is_actionable(&TargetKind::Container, &resource.kind, *is_init) {
                    continue;
                }
                let scope = Scope::Container { index: *index, is_init: *is_init };
                if let Some(message) =
                    self.run_check(check, provider, resource, container, &scope)
                {
                    container_results[slot].results.insert(check_id.clone(), message);
                }
            }
        }

        if resource.pod_spec.is_some() && scan_workload {
            container_results.retain(|c| !c.results.is_empty());
            if !pod_result.results.is_empty() || !container_results.is_empty() {
                pod_result.container_results = container_results;
                result.pod_result = Some(pod_result);
            }
        }
        result
    }

    /// Resolves exemptions and templating, runs the schema plus any
    /// additional validators, and shapes the outcome into a message.
    fn run_check(
        &self,
        check: &SchemaCheck,
        provider: &ResourceProvider,
        resource: &GenericResource,
        object: &Value,
        scope: &Scope,
    ) -> Option<ResultMessage> {
        let container_name = match scope {
            Scope::Container { .. } => object["name"].as_str().unwrap_or_default(),
            _ => "",
        };
        if self.config.has_exemption_annotation(&resource.object_meta, &check.id) {
            return None;
        }
        if !self
            .config
            .is_actionable(&check.id, &resource.object_meta, container_name)
        {
            return None;
        }

        let check = match check.template_for_resource(
            &resource.resource,
            resource.pod_spec.as_ref(),
            resource.pod_template.as_ref(),
        ) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(check = %check.id, error = %e, "schema template failed, skipping");
                return None;
            }
        };

        let outcome = match scope {
            Scope::Container { .. } => check.check_container(object),
            _ => check.check_object(object),
        };
        let (mut passed, mut details) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(check = %check.id, error = %e, "schema evaluation failed, skipping");
                return None;
            }
        };

        if passed {
            let test = SchemaTestCase { resource, provider };
            for validator in &check.additional_validators {
                match self.validators.run(validator, &test) {
                    Ok((ok, extra)) => {
                        if !ok {
                            passed = false;
                            details.extend(extra);
                        }
                    }
                    Err(e) => {
                        warn!(check = %check.id, error = %e, "validator failed, skipping");
                        return None;
                    }
                }
            }
        }

        Some(self.make_result(&check, resource, scope, passed, details))
    }

    fn make_result(
        &self,
        check: &SchemaCheck,
        resource: &GenericResource,
        scope: &Scope,
        passed: bool,
        details: Vec<String>,
    ) -> ResultMessage {
        let message = if passed {
            check.success_message.clone()
        } else {
            check.failure_message.clone()
        };
        let mut mutations = Vec::new();
        let mut comments = Vec::new();
        if !passed && self.config.mutations.iter().any(|id| id == &check.id) {
            let prefix = mutation_prefix(&resource.kind, scope);
            mutations = check
                .mutations
                .iter()
                .map(|m| prefix_mutation(m, &prefix))
                .collect();
            comments = check.comments.clone();
        }
        ResultMessage {
            id: check.id.clone(),
            message,
            details,
            success: passed,
            severity: self.config.severity(&check.id),
            category: check.category.clone(),
            mutations,
            comments,
        }
    }
}

fn container_entries(pod_spec: &Value) -> Vec<(bool, usize, &Value)> {
    let mut entries = Vec::new();
    for (field, is_init) in [("initContainers", true), ("containers", false)] {
        if let Some(items) = pod_spec[field].as_array() {
            for (index, container) in items.iter().enumerate() {
                entries.push((is_init, index, container));
            }
        }
    }
    entries
}

fn pod_spec_pointer(kind: &str) -> Option<&'static str> {
    match kind {
        "Pod" => Some("/spec"),
        "CronJob" => Some("/spec/jobTemplate/spec/template/spec"),
        "Deployment" | "DaemonSet" | "StatefulSet" | "Job" | "ReplicaSet"
        | "ReplicationController" => Some("/spec/template/spec"),
        _ => None,
    }
}

fn mutation_prefix(kind: &str, scope: &Scope) -> String {
    let pod_pointer = match scope {
        Scope::Resource => return String::new(),
        _ => match pod_spec_pointer(kind) {
            Some(pointer) => pointer,
            None => {
                warn!(kind, "no pod spec pointer for kind, mutation paths left unprefixed");
                return String::new();
            }
        },
    };
    match scope {
        Scope::Container { index, is_init } => {
            let field = if *is_init { "initContainers" } else { "containers" };
            format!("{pod_pointer}/{field}/{index}")
        }
        _ => pod_pointer.to_string(),
    }
}

fn prefix_mutation(mutation: &Mutation, prefix: &str) -> Mutation {
    let mut prefixed = mutation.clone();
    prefixed.path = format!("{prefix}{}", mutation.path);
    if let Some(from) = &mutation.from {
        prefixed.from = Some(format!("{prefix}{from}"));
    }
    prefixed
}
