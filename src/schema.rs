use std::fmt;
use std::sync::Arc;

use jsonschema::paths::{LazyLocation, Location};
use jsonschema::{Keyword, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::quantity::Quantity;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("check {id} is missing required field {field}")]
    MissingField { id: String, field: &'static str },
    #[error("check {0} has neither schema nor schemaString")]
    SchemaMissing(String),
    #[error("check {id} has an invalid schema: {reason}")]
    InvalidSchema { id: String, reason: String },
    #[error("check {id} schema template failed to render: {reason}")]
    Template { id: String, reason: String },
    #[error("check {id} rendered schema is not valid YAML: {reason}")]
    RenderedSchema { id: String, reason: String },
}

/// The object level a check evaluates against. Anything other than the four
/// named levels is an arbitrary `group/Kind` target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum TargetKind {
    #[default]
    Container,
    Controller,
    PodSpec,
    PodTemplate,
    Kind(String),
}

impl From<String> for TargetKind {
    fn from(s: String) -> TargetKind {
        match s.as_str() {
            "Container" => TargetKind::Container,
            "Controller" => TargetKind::Controller,
            "PodSpec" => TargetKind::PodSpec,
            "PodTemplate" => TargetKind::PodTemplate,
            _ => TargetKind::Kind(s),
        }
    }
}

impl From<TargetKind> for String {
    fn from(t: TargetKind) -> String {
        match t {
            TargetKind::Container => "Container".to_string(),
            TargetKind::Controller => "Controller".to_string(),
            TargetKind::PodSpec => "PodSpec".to_string(),
            TargetKind::PodTemplate => "PodTemplate".to_string(),
            TargetKind::Kind(s) => s,
        }
    }
}

impl TargetKind {
    /// Whether a kind target names the given resource kind. Targets may be
    /// qualified with an API group, e.g. `networking.k8s.io/Ingress`.
    pub fn matches_kind(&self, kind: &str) -> bool {
        match self {
            TargetKind::Kind(t) => t == kind || t.ends_with(&format!("/{kind}")),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IncludeExcludeList {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl IncludeExcludeList {
    pub fn allows(&self, name: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|i| i == name) {
            return false;
        }
        !self.exclude.iter().any(|e| e == name)
    }
}

/// A single JSON-Patch operation attached to a check, applied when the check
/// fails and the check ID is listed under the configuration's `mutations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub op: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// A comment appended to the manifest line whose trimmed text equals `find`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationComment {
    pub find: String,
    pub comment: String,
}

#[derive(Clone)]
struct Compiled(Arc<jsonschema::Validator>);

impl fmt::Debug for Compiled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Compiled")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchemaCheck {
    #[serde(skip)]
    pub id: String,
    pub category: String,
    pub success_message: String,
    pub failure_message: String,
    pub controllers: IncludeExcludeList,
    pub containers: IncludeExcludeList,
    pub target: TargetKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_target: Option<TargetKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_string: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_validators: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mutations: Vec<Mutation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<MutationComment>,
    #[serde(skip)]
    templated: bool,
    #[serde(skip)]
    validator: Option<Compiled>,
}

impl SchemaCheck {
    /// Validates required fields and precompiles the schema. Templated
    /// schemas are compiled later, once per resource, by
    /// [`SchemaCheck::template_for_resource`].
    pub fn initialize(&mut self, id: &str) -> Result<(), SchemaError> {
        self.id = id.to_string();
        if self.success_message.is_empty() {
            return Err(self.missing("successMessage"));
        }
        if self.failure_message.is_empty() {
            return Err(self.missing("failureMessage"));
        }
        if self.category.is_empty() {
            return Err(self.missing("category"));
        }
        if matches!(&self.target, TargetKind::Kind(k) if k.is_empty()) {
            return Err(self.missing("target"));
        }
        if let Some(schema) = &self.schema {
            self.validator = Some(Compiled(Arc::new(compile_schema(&self.id, schema)?)));
        } else if let Some(raw) = self.schema_string.clone() {
            if raw.contains("{{") || raw.contains("{%") {
                self.templated = true;
            } else {
                let schema: Value =
                    serde_yaml::from_str(&raw).map_err(|e| SchemaError::InvalidSchema {
                        id: self.id.clone(),
                        reason: e.to_string(),
                    })?;
                self.validator = Some(Compiled(Arc::new(compile_schema(&self.id, &schema)?)));
                self.schema = Some(schema);
            }
        } else {
            return Err(SchemaError::SchemaMissing(self.id.clone()));
        }
        Ok(())
    }

    pub fn is_templated(&self) -> bool {
        self.templated
    }

    /// Renders a templated schema against a concrete resource and returns a
    /// copy of the check with the rendered schema compiled. Non-templated
    /// checks are returned as-is.
    pub fn template_for_resource(
        &self,
        resource: &Value,
        pod_spec: Option<&Value>,
        pod_template: Option<&Value>,
    ) -> Result<SchemaCheck, SchemaError> {
        if !self.templated {
            return Ok(self.clone());
        }
        let raw = self
            .schema_string
            .as_deref()
            .ok_or_else(|| SchemaError::SchemaMissing(self.id.clone()))?;

        let mut polaris = Map::new();
        polaris.insert("Resource".to_string(), resource.clone());
        if let Some(spec) = pod_spec {
            polaris.insert("PodSpec".to_string(), spec.clone());
        }
        if let Some(template) = pod_template {
            polaris.insert("PodTemplate".to_string(), template.clone());
        }
        let mut root = Map::new();
        root.insert("Polaris".to_string(), Value::Object(polaris));
        let context =
            tera::Context::from_value(Value::Object(root)).map_err(|e| SchemaError::Template {
                id: self.id.clone(),
                reason: e.to_string(),
            })?;

        let rendered =
            tera::Tera::one_off(raw, &context, false).map_err(|e| SchemaError::Template {
                id: self.id.clone(),
                reason: e.to_string(),
            })?;
        let schema: Value =
            serde_yaml::from_str(&rendered).map_err(|e| SchemaError::RenderedSchema {
                id: self.id.clone(),
                reason: e.to_string(),
            })?;

        let mut templated = self.clone();
        templated.validator = Some(Compiled(Arc::new(compile_schema(&self.id, &schema)?)));
        templated.schema = Some(schema);
        templated.schema_string = Some(rendered);
        templated.templated = false;
        Ok(templated)
    }

    /// Whether this check participates in the given evaluation pass for a
    /// resource of the given kind.
    pub fn is_actionable(&self, pass: &TargetKind, kind: &str, is_init: bool) -> bool {
        let pass_matches = match (&self.target, pass) {
            (TargetKind::Container, TargetKind::Container) => true,
            (TargetKind::PodSpec, TargetKind::PodSpec) => true,
            // PodTemplate checks see the template wrapper during the pod pass.
            (TargetKind::PodTemplate, TargetKind::PodSpec) => true,
            (TargetKind::PodTemplate, TargetKind::PodTemplate) => true,
            (TargetKind::Controller, TargetKind::Controller) => true,
            (TargetKind::Kind(_), TargetKind::Controller) => self.target.matches_kind(kind),
            _ => false,
        };
        if !pass_matches {
            return false;
        }
        if !self.controllers.allows(kind) {
            return false;
        }
        if self.target == TargetKind::Container {
            let container_type = if is_init { "initContainer" } else { "container" };
            if !self.containers.allows(container_type) {
                return false;
            }
        }
        true
    }

    /// Runs the schema against an arbitrary JSON object, returning whether it
    /// passed plus one detail line per validation error.
    pub fn check_object(&self, object: &Value) -> Result<(bool, Vec<String>), SchemaError> {
        let validator = self
            .validator
            .as_ref()
            .ok_or_else(|| SchemaError::SchemaMissing(self.id.clone()))?;
        if validator.0.is_valid(object) {
            return Ok((true, Vec::new()));
        }
        let details = validator
            .0
            .iter_errors(object)
            .map(|e| e.to_string())
            .collect();
        Ok((false, details))
    }

    pub fn check_pod_spec(&self, pod_spec: &Value) -> Result<(bool, Vec<String>), SchemaError> {
        self.check_object(pod_spec)
    }

    /// Container checks whose schema targets the pod level are re-dispatched
    /// against a synthetic single-container pod spec.
    pub fn check_container(&self, container: &Value) -> Result<(bool, Vec<String>), SchemaError> {
        if self.schema_target == Some(TargetKind::PodSpec) {
            let synthetic = serde_json::json!({ "containers": [container] });
            return self.check_object(&synthetic);
        }
        self.check_object(container)
    }

    fn missing(&self, field: &'static str) -> SchemaError {
        SchemaError::MissingField {
            id: self.id.clone(),
            field,
        }
    }
}

fn compile_schema(id: &str, schema: &Value) -> Result<jsonschema::Validator, SchemaError> {
    jsonschema::options()
        .with_keyword("resourceMinimum", resource_minimum_factory)
        .with_keyword("resourceMaximum", resource_maximum_factory)
        .build(schema)
        .map_err(|e| SchemaError::InvalidSchema {
            id: id.to_string(),
            reason: e.to_string(),
        })
}

#[derive(Clone, Copy)]
enum BoundKind {
    Minimum,
    Maximum,
}

struct ResourceBound {
    kind: BoundKind,
    bound: Quantity,
    raw: String,
}

impl Keyword for ResourceBound {
    fn validate<'i>(
        &self,
        instance: &'i Value,
        location: &LazyLocation,
    ) -> Result<(), ValidationError<'i>> {
        if self.is_valid(instance) {
            return Ok(());
        }
        let relation = match self.kind {
            BoundKind::Minimum => "below the minimum",
            BoundKind::Maximum => "above the maximum",
        };
        let shown = quantity_text(instance).unwrap_or_else(|| instance.to_string());
        Err(ValidationError::custom(
            Location::new(),
            location.into(),
            instance,
            format!("quantity {shown} is {relation} of {}", self.raw),
        ))
    }

    fn is_valid(&self, instance: &Value) -> bool {
        let Some(raw) = quantity_text(instance) else {
            return false;
        };
        let Ok(quantity) = raw.parse::<Quantity>() else {
            return false;
        };
        match self.kind {
            BoundKind::Minimum => quantity >= self.bound,
            BoundKind::Maximum => quantity <= self.bound,
        }
    }
}

/// Quantities arrive as strings or bare numbers; anything else is not a
/// quantity at all.
fn quantity_text(instance: &Value) -> Option<String> {
    match instance {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn resource_bound_factory<'a>(
    kind: BoundKind,
    keyword: &'static str,
    value: &'a Value,
    path: Location,
) -> Result<Box<dyn Keyword>, ValidationError<'a>> {
    let Some(raw) = value.as_str() else {
        return Err(ValidationError::custom(
            Location::new(),
            path,
            value,
            format!("{keyword} must be a quantity string"),
        ));
    };
    let bound: Quantity = raw.parse().map_err(|e| {
        ValidationError::custom(
            Location::new(),
            path.clone(),
            value,
            format!("{keyword} is not a valid quantity: {e}"),
        )
    })?;
    Ok(Box::new(ResourceBound {
        kind,
        bound,
        raw: raw.to_string(),
    }))
}

fn resource_minimum_factory<'a>(
    _parent: &'a Map<String, Value>,
    value: &'a Value,
    path: Location,
) -> Result<Box<dyn Keyword>, ValidationError<'a>> {
    resource_bound_factory(BoundKind::Minimum, "resourceMinimum", value, path)
}

fn resource_maximum_factory<'a>(
    _parent: &'a Map<String, Value>,
    value: &'a Value,
    path: Location,
) -> Result<Box<dyn Keyword>, ValidationError<'a>> {
    resource_bound_factory(BoundKind::Maximum, "resourceMaximum", value, path)
}
