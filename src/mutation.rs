use serde_json::Value;
use thiserror::Error;

use crate::output::ResourceResult;
use crate::schema::{Mutation, MutationComment};

pub const TEMPLATE_OPEN_MARKER: &str = "POLARIS_OPEN_TMPL";
pub const TEMPLATE_CLOSE_MARKER: &str = "POLARIS_CLOSE_TMPL";

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("mutation is not a valid patch operation: {0}")]
    InvalidOperation(#[from] serde_json::Error),
    #[error("failed to apply patch: {0}")]
    Apply(#[from] json_patch::PatchError),
    #[error("mutated resource is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Gathers every mutation and comment a resource's results carry, top level
/// first, then pod, then containers; rule order within a scope is
/// lexicographic by ID.
pub fn collect_mutations(result: &ResourceResult) -> (Vec<Mutation>, Vec<MutationComment>) {
    let mut mutations = Vec::new();
    let mut comments = Vec::new();
    for set in result.all_result_sets() {
        for message in set.values() {
            mutations.extend(message.mutations.iter().cloned());
            comments.extend(message.comments.iter().cloned());
        }
    }
    (mutations, comments)
}

/// Applies mutations to a copy of the resource JSON. `remove` on a missing
/// path is a no-op; `add` creates missing intermediate objects. Any failure
/// abandons the whole resource.
pub fn apply_mutations(resource: &Value, mutations: &[Mutation]) -> Result<Value, MutationError> {
    let mut doc = resource.clone();
    for mutation in mutations {
        for path in expand_wildcards(&doc, &mutation.path) {
            let mut concrete = mutation.clone();
            concrete.path = path;
            match concrete.op.as_str() {
                "remove" if doc.pointer(&concrete.path).is_none() => continue,
                "add" => ensure_parent_path(&mut doc, &concrete.path),
                _ => {}
            }
            let patch: json_patch::Patch =
                serde_json::from_value(serde_json::json!([concrete]))?;
            json_patch::patch(&mut doc, &patch)?;
        }
    }
    Ok(doc)
}

/// Expands `*` path segments against the arrays actually present. A wildcard
/// over a missing or non-array value expands to nothing.
fn expand_wildcards(doc: &Value, path: &str) -> Vec<String> {
    if !path.contains('*') {
        return vec![path.to_string()];
    }
    let segments: Vec<&str> = path.split('/').skip(1).collect();
    let mut paths = Vec::new();
    expand_segments(doc, &segments, String::new(), &mut paths);
    paths
}

fn expand_segments(value: &Value, segments: &[&str], prefix: String, out: &mut Vec<String>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(prefix);
        return;
    };
    if *head == "*" {
        if let Some(items) = value.as_array() {
            for (index, item) in items.iter().enumerate() {
                expand_segments(item, rest, format!("{prefix}/{index}"), out);
            }
        }
        return;
    }
    let next = match value {
        Value::Object(map) => map.get(*head),
        Value::Array(items) => head.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    };
    match next {
        Some(inner) => expand_segments(inner, rest, format!("{prefix}/{head}"), out),
        None => {
            // The remainder can't contain further wildcards worth expanding;
            // keep the literal path so `add` can create it.
            if rest.iter().any(|s| *s == "*") {
                return;
            }
            let mut full = prefix;
            full.push('/');
            full.push_str(head);
            for segment in rest {
                full.push('/');
                full.push_str(segment);
            }
            out.push(full);
        }
    }
}

// RFC 6902 `add` fails on missing intermediate paths; pre-create them as
// empty objects.
fn ensure_parent_path(doc: &mut Value, pointer: &str) {
    let segments: Vec<&str> = pointer.split('/').skip(1).collect();
    if segments.len() <= 1 {
        return;
    }
    let mut current = doc;
    for segment in &segments[..segments.len() - 1] {
        if current.is_null() {
            *current = Value::Object(Default::default());
        }
        match current {
            Value::Object(map) => {
                current = map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Default::default()));
            }
            Value::Array(items) => {
                let Some(item) = segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get_mut(i))
                else {
                    return;
                };
                current = item;
            }
            _ => return,
        }
    }
}

pub fn to_yaml(value: &Value) -> Result<String, MutationError> {
    Ok(serde_yaml::to_string(value)?)
}

/// Appends ` #comment` to every line whose trimmed text equals a comment's
/// `find` string.
pub fn inject_comments(yaml: &str, comments: &[MutationComment]) -> String {
    let mut out = String::with_capacity(yaml.len());
    for line in yaml.lines() {
        match comments.iter().find(|c| c.find == line.trim()) {
            Some(comment) => {
                out.push_str(line);
                out.push_str(" #");
                out.push_str(&comment.comment);
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }
    out
}

/// A Helm template directive pulled out of a manifest so the YAML parses,
/// remembered together with the nearest preceding plain line so it can be
/// put back after re-emission.
#[derive(Debug, Clone)]
struct Directive {
    line: String,
    anchor: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct TemplateDirectives {
    directives: Vec<Directive>,
}

/// Makes Helm-templated content parseable: whole-line `{{ ... }}` directives
/// are lifted out (and remembered), in-line braces are replaced with sentinel
/// words that survive the YAML round trip.
pub fn detemplate(content: &str) -> (String, TemplateDirectives) {
    let mut lines = Vec::new();
    let mut directives = Vec::new();
    let mut last_plain: Option<String> = None;
    for line in content.lines() {
        if line.trim_start().starts_with("{{") {
            directives.push(Directive {
                line: line.to_string(),
                anchor: last_plain.clone(),
            });
            continue;
        }
        if !line.trim().is_empty() {
            last_plain = Some(line.trim().to_string());
        }
        lines.push(
            line.replace('{', TEMPLATE_OPEN_MARKER)
                .replace('}', TEMPLATE_CLOSE_MARKER),
        );
    }
    let mut out = lines.join("\n");
    out.push('\n');
    (out, TemplateDirectives { directives })
}

/// Restores braces and re-inserts lifted directive lines after their anchor
/// lines. A directive that never had an anchor goes back to the top; one
/// whose anchor line no longer exists goes to the end.
pub fn retemplate(content: &str, directives: &TemplateDirectives) -> String {
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            line.replace(TEMPLATE_OPEN_MARKER, "{")
                .replace(TEMPLATE_CLOSE_MARKER, "}")
        })
        .collect();

    let mut top = 0;
    let mut cursor = 0;
    for directive in &directives.directives {
        let Some(anchor) = &directive.anchor else {
            lines.insert(top, directive.line.clone());
            top += 1;
            cursor = cursor.max(top);
            continue;
        };
        let position = lines[cursor..]
            .iter()
            .position(|line| line.trim() == anchor.as_str())
            .map(|offset| cursor + offset + 1);
        match position {
            Some(index) => {
                lines.insert(index, directive.line.clone());
                cursor = index + 1;
            }
            None => lines.push(directive.line.clone()),
        }
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation(op: &str, path: &str, value: Option<Value>) -> Mutation {
        Mutation {
            op: op.to_string(),
            path: path.to_string(),
            value,
            from: None,
        }
    }

    #[test]
    fn test_add_creates_missing_parents() {
        let resource = json!({"spec": {"containers": [{"name": "app"}]}});
        let mutations = vec![mutation(
            "add",
            "/spec/containers/0/resources/requests/cpu",
            Some(json!("100m")),
        )];
        let mutated = apply_mutations(&resource, &mutations).unwrap();
        assert_eq!(
            mutated["spec"]["containers"][0]["resources"]["requests"]["cpu"],
            json!("100m")
        );
    }

    #[test]
    fn test_remove_missing_path_is_ignored() {
        let resource = json!({"spec": {}});
        let mutations = vec![mutation("remove", "/spec/hostNetwork", None)];
        let mutated = apply_mutations(&resource, &mutations).unwrap();
        assert_eq!(mutated, resource);
    }

    #[test]
    fn test_replace_existing_value() {
        let resource = json!({"spec": {"containers": [{"imagePullPolicy": "IfNotPresent"}]}});
        let mutations = vec![mutation(
            "replace",
            "/spec/containers/0/imagePullPolicy",
            Some(json!("Always")),
        )];
        let mutated = apply_mutations(&resource, &mutations).unwrap();
        assert_eq!(mutated["spec"]["containers"][0]["imagePullPolicy"], json!("Always"));
    }

    #[test]
    fn test_wildcard_expansion() {
        let resource = json!({"spec": {"containers": [
            {"name": "a"}, {"name": "b"}
        ]}});
        let mutations = vec![mutation(
            "add",
            "/spec/containers/*/imagePullPolicy",
            Some(json!("Always")),
        )];
        let mutated = apply_mutations(&resource, &mutations).unwrap();
        assert_eq!(mutated["spec"]["containers"][0]["imagePullPolicy"], json!("Always"));
        assert_eq!(mutated["spec"]["containers"][1]["imagePullPolicy"], json!("Always"));
    }

    #[test]
    fn test_wildcard_over_missing_array_expands_to_nothing() {
        let resource = json!({"spec": {}});
        let mutations = vec![mutation(
            "add",
            "/spec/containers/*/imagePullPolicy",
            Some(json!("Always")),
        )];
        let mutated = apply_mutations(&resource, &mutations).unwrap();
        assert_eq!(mutated, resource);
    }

    #[test]
    fn test_collect_mutations_in_scope_order() {
        use crate::config::Severity;
        use crate::output::{ContainerResult, PodResult, ResultMessage};

        let message = |id: &str, path: &str| ResultMessage {
            id: id.to_string(),
            message: String::new(),
            details: Vec::new(),
            success: false,
            severity: Severity::Warning,
            category: "Security".to_string(),
            mutations: vec![mutation("add", path, Some(json!(true)))],
            comments: Vec::new(),
        };
        let mut result = ResourceResult::default();
        result.results.insert("top".into(), message("top", "/top"));
        result.pod_result = Some(PodResult {
            name: String::new(),
            results: [("pod".to_string(), message("pod", "/pod"))].into(),
            container_results: vec![ContainerResult {
                name: "app".to_string(),
                results: [("cont".to_string(), message("cont", "/cont"))].into(),
            }],
        });
        let (mutations, _) = collect_mutations(&result);
        let paths: Vec<&str> = mutations.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["/top", "/pod", "/cont"]);
    }

    #[test]
    fn test_inject_comments() {
        let comments = vec![MutationComment {
            find: "imagePullPolicy: Always".to_string(),
            comment: "enforced".to_string(),
        }];
        let yaml = "spec:\n  imagePullPolicy: Always\n";
        assert_eq!(
            inject_comments(yaml, &comments),
            "spec:\n  imagePullPolicy: Always #enforced\n"
        );
    }

    #[test]
    fn test_detemplate_retemplate_round_trip() {
        let content = "{{- if .Values.enabled }}\napiVersion: v1\nkind: Pod\nmetadata:\n  name: {{ .Values.name }}\n{{- end }}\n";
        let (plain, directives) = detemplate(content);
        assert!(!plain.contains("{{"));
        assert!(plain.contains(TEMPLATE_OPEN_MARKER));
        assert!(serde_yaml::from_str::<Value>(&plain).is_ok());

        let restored = retemplate(&plain, &directives);
        assert_eq!(restored, content);
    }

    #[test]
    fn test_retemplate_after_mutation_keeps_directives() {
        let content = "apiVersion: v1\nkind: Pod\nspec:\n  hostNetwork: true\n{{- if .Values.x }}\n";
        let (plain, directives) = detemplate(content);
        let value: Value = serde_yaml::from_str(&plain).unwrap();
        let mutated = apply_mutations(
            &value,
            &[mutation("remove", "/spec/hostNetwork", None)],
        )
        .unwrap();
        let emitted = to_yaml(&mutated).unwrap();
        let restored = retemplate(&emitted, &directives);
        assert!(restored.contains("{{- if .Values.x }}"));
        assert!(!restored.contains("hostNetwork"));
    }
}
