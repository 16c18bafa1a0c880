use std::collections::BTreeMap;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Severity;
use crate::schema::{Mutation, MutationComment};

pub const POLARIS_OUTPUT_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to serialize audit to JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to serialize audit to YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultMessage {
    #[serde(rename = "ID")]
    pub id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    pub success: bool,
    pub severity: Severity,
    pub category: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutations: Vec<Mutation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<MutationComment>,
}

/// At most one message per rule per evaluation scope.
pub type ResultSet = BTreeMap<String, ResultMessage>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerResult {
    pub name: String,
    pub results: ResultSet,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodResult {
    #[serde(default)]
    pub name: String,
    pub results: ResultSet,
    pub container_results: Vec<ContainerResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceResult {
    pub name: String,
    pub namespace: String,
    pub kind: String,
    pub results: ResultSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_result: Option<PodResult>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterInfo {
    pub version: String,
    pub nodes: usize,
    pub pods: usize,
    pub namespaces: usize,
    pub controllers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuditData {
    pub polaris_output_version: String,
    pub audit_time: String,
    pub source_type: String,
    pub source_name: String,
    #[serde(default)]
    pub display_name: String,
    pub cluster_info: ClusterInfo,
    pub results: Vec<ResourceResult>,
    pub score: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CountSummary {
    pub successes: u32,
    pub warnings: u32,
    pub dangers: u32,
}

impl CountSummary {
    pub fn add_message(&mut self, message: &ResultMessage) {
        if message.success {
            self.successes += 1;
        } else {
            match message.severity {
                Severity::Danger => self.dangers += 1,
                _ => self.warnings += 1,
            }
        }
    }

    /// Dangers and successes carry double weight so a passing rule offsets a
    /// failing one. Zero denominator means nothing was evaluated.
    pub fn score(&self) -> u32 {
        let denominator = 2 * self.successes + self.warnings + 2 * self.dangers;
        if denominator == 0 {
            0
        } else {
            200 * self.successes / denominator
        }
    }
}

impl AddAssign for CountSummary {
    fn add_assign(&mut self, other: CountSummary) {
        self.successes += other.successes;
        self.warnings += other.warnings;
        self.dangers += other.dangers;
    }
}

impl ResourceResult {
    /// Every ResultSet in this resource, top level first, then pod, then
    /// containers.
    pub fn all_result_sets(&self) -> Vec<&ResultSet> {
        let mut sets = vec![&self.results];
        if let Some(pod) = &self.pod_result {
            sets.push(&pod.results);
            for container in &pod.container_results {
                sets.push(&container.results);
            }
        }
        sets
    }

    pub fn summary(&self) -> CountSummary {
        let mut summary = CountSummary::default();
        for set in self.all_result_sets() {
            for message in set.values() {
                summary.add_message(message);
            }
        }
        summary
    }
}

pub fn count_results(results: &[ResourceResult]) -> CountSummary {
    let mut summary = CountSummary::default();
    for result in results {
        summary += result.summary();
    }
    summary
}

/// Element-wise per-category sums across every scope.
pub fn count_by_category(results: &[ResourceResult]) -> BTreeMap<String, CountSummary> {
    let mut categories: BTreeMap<String, CountSummary> = BTreeMap::new();
    for result in results {
        for set in result.all_result_sets() {
            for message in set.values() {
                categories
                    .entry(message.category.clone())
                    .or_default()
                    .add_message(message);
            }
        }
    }
    categories
}

pub fn grade(score: u32) -> &'static str {
    match score {
        97.. => "A+",
        93.. => "A",
        90.. => "A-",
        87.. => "B+",
        83.. => "B",
        80.. => "B-",
        77.. => "C+",
        73.. => "C",
        70.. => "C-",
        67.. => "D+",
        63.. => "D",
        60.. => "D-",
        _ => "F",
    }
}

pub fn weather_icon(score: u32) -> &'static str {
    match score {
        90.. => "fa-sun",
        80.. => "fa-cloud-sun",
        70.. => "fa-cloud",
        60.. => "fa-cloud-rain",
        _ => "fa-cloud-showers-heavy",
    }
}

pub fn weather_text(score: u32) -> &'static str {
    match score {
        90.. => "Smooth sailing",
        80.. => "Mostly sunny",
        70.. => "Partly cloudy",
        60.. => "Expect rain",
        _ => "Storms ahead, be careful",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
    Score,
}

impl OutputFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Json => "application/json",
            OutputFormat::Yaml => "application/x-yaml",
            OutputFormat::Score => "text/plain",
        }
    }
}

impl AuditData {
    pub fn new(
        source_type: &str,
        source_name: &str,
        display_name: &str,
        cluster_info: ClusterInfo,
        results: Vec<ResourceResult>,
    ) -> AuditData {
        let score = count_results(&results).score();
        AuditData {
            polaris_output_version: POLARIS_OUTPUT_VERSION.to_string(),
            audit_time: Utc::now().to_rfc3339(),
            source_type: source_type.to_string(),
            source_name: source_name.to_string(),
            display_name: display_name.to_string(),
            cluster_info,
            results,
            score,
        }
    }

    pub fn summary(&self) -> CountSummary {
        count_results(&self.results)
    }

    /// Drops passing messages; resources left with no messages at all are
    /// dropped too.
    pub fn remove_successful_results(&mut self) {
        for result in &mut self.results {
            result.results.retain(|_, m| !m.success);
            if let Some(pod) = &mut result.pod_result {
                pod.results.retain(|_, m| !m.success);
                for container in &mut pod.container_results {
                    container.results.retain(|_, m| !m.success);
                }
                pod.container_results.retain(|c| !c.results.is_empty());
                if pod.results.is_empty() && pod.container_results.is_empty() {
                    result.pod_result = None;
                }
            }
        }
        self.results
            .retain(|r| !r.results.is_empty() || r.pod_result.is_some());
    }

    /// Keeps only messages at or above the given severity.
    pub fn filter_by_severity(&mut self, minimum: Severity) {
        for result in &mut self.results {
            result.results.retain(|_, m| m.severity >= minimum);
            if let Some(pod) = &mut result.pod_result {
                pod.results.retain(|_, m| m.severity >= minimum);
                for container in &mut pod.container_results {
                    container.results.retain(|_, m| m.severity >= minimum);
                }
            }
        }
    }

    pub fn render(&self, format: OutputFormat) -> Result<String, OutputError> {
        match format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            OutputFormat::Yaml => Ok(serde_yaml::to_string(self)?),
            OutputFormat::Score => Ok(format!("{}\n", self.score)),
        }
    }
}

/// Re-reads a stored audit. YAML parsing accepts JSON input as well.
pub fn parse_audit(raw: &str) -> Result<AuditData, OutputError> {
    Ok(serde_yaml::from_str(raw)?)
}
