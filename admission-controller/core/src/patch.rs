use std::collections::BTreeMap;

use json_patch::{AddOperation, Patch, PatchOperation};
use serde_json::json;

use crate::labels;

const AUTO_GEN_APP_PREFIX: &str = "yunikorn";
const AUTO_GEN_APP_SUFFIX: &str = "autogen";

/// Kubernetes caps object names at 63 characters; generated application ids
/// are reused as names downstream and must fit the same limit.
const GENERATED_ID_MAX_LEN: usize = 63;

/// Builds the ordered mutation for a pod that passed the namespace policy.
///
/// The scheduler-name operation always comes first; the label operation, when
/// labeling applies, replaces `/metadata/labels` wholesale so the two
/// operations never target overlapping paths.
pub fn pod_mutation(
    namespace: &str,
    existing_labels: &BTreeMap<String, String>,
    should_label: bool,
) -> Patch {
    let mut ops = vec![scheduler_name_op()];
    if should_label {
        ops.push(labels_op(namespace, existing_labels));
    }
    Patch(ops)
}

fn scheduler_name_op() -> PatchOperation {
    PatchOperation::Add(AddOperation {
        path: "/spec/schedulerName".into(),
        value: json!(labels::SCHEDULER_NAME),
    })
}

fn labels_op(namespace: &str, existing: &BTreeMap<String, String>) -> PatchOperation {
    let mut result = existing.clone();

    if !existing.contains_key(labels::SPARK_APP_SELECTOR_LABEL)
        && !existing.contains_key(labels::APP_ID_LABEL)
    {
        // Unnamed pods are grouped into one application per namespace.
        result.insert(labels::APP_ID_LABEL.to_string(), generate_app_id(namespace));

        // Auto-generated applications are treated as stateless.
        if !existing.contains_key(labels::DISABLE_STATE_AWARE_LABEL) {
            result.insert(labels::DISABLE_STATE_AWARE_LABEL.to_string(), "true".to_string());
        }
    }

    if !existing.contains_key(labels::QUEUE_LABEL) {
        result.insert(labels::QUEUE_LABEL.to_string(), labels::DEFAULT_QUEUE.to_string());
    }

    PatchOperation::Add(AddOperation {
        path: "/metadata/labels".into(),
        value: json!(result),
    })
}

/// Derives a deterministic application id from the namespace, capped at 63
/// characters.
pub fn generate_app_id(namespace: &str) -> String {
    let mut id = format!("{AUTO_GEN_APP_PREFIX}-{namespace}-{AUTO_GEN_APP_SUFFIX}");
    if id.len() > GENERATED_ID_MAX_LEN {
        id.truncate(GENERATED_ID_MAX_LEN);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn labels_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn label_value(patch: &Patch, key: &str) -> Option<Value> {
        match &patch.0[1] {
            PatchOperation::Add(op) => op.value.get(key).cloned(),
            op => panic!("expected an add operation, got {op:?}"),
        }
    }

    #[test]
    fn generates_app_id_from_namespace() {
        assert_eq!(generate_app_id("ns1"), "yunikorn-ns1-autogen");
    }

    #[test]
    fn app_id_is_deterministic() {
        assert_eq!(generate_app_id("ns1"), generate_app_id("ns1"));
    }

    #[test]
    fn long_app_ids_are_truncated_to_63_characters() {
        let namespace = "n".repeat(100);
        let id = generate_app_id(&namespace);
        assert_eq!(id.len(), 63);
        assert!(id.starts_with("yunikorn-nnn"));
    }

    #[test]
    fn scheduler_name_operation_comes_first() {
        let patch = pod_mutation("ns1", &BTreeMap::new(), true);
        assert_eq!(patch.0.len(), 2);
        match &patch.0[0] {
            PatchOperation::Add(op) => {
                assert_eq!(op.path, "/spec/schedulerName");
                assert_eq!(op.value, json!("yunikorn"));
            }
            op => panic!("expected an add operation, got {op:?}"),
        }
    }

    #[test]
    fn labels_are_replaced_wholesale() {
        let existing = labels_of(&[("team", "ops")]);
        let patch = pod_mutation("ns1", &existing, true);
        match &patch.0[1] {
            PatchOperation::Add(op) => {
                assert_eq!(op.path, "/metadata/labels");
                assert_eq!(op.value.get("team"), Some(&json!("ops")));
            }
            op => panic!("expected an add operation, got {op:?}"),
        }
    }

    #[test]
    fn synthesized_app_id_disables_state_aware_scheduling() {
        let patch = pod_mutation("ns1", &BTreeMap::new(), true);
        assert_eq!(
            label_value(&patch, labels::APP_ID_LABEL),
            Some(json!("yunikorn-ns1-autogen"))
        );
        assert_eq!(
            label_value(&patch, labels::DISABLE_STATE_AWARE_LABEL),
            Some(json!("true"))
        );
    }

    #[test]
    fn existing_app_id_is_left_alone() {
        let existing = labels_of(&[(labels::APP_ID_LABEL, "my-app")]);
        let patch = pod_mutation("ns1", &existing, true);
        assert_eq!(label_value(&patch, labels::APP_ID_LABEL), Some(json!("my-app")));
        assert_eq!(label_value(&patch, labels::DISABLE_STATE_AWARE_LABEL), None);
    }

    #[test]
    fn spark_app_selector_counts_as_an_app_id() {
        let existing = labels_of(&[(labels::SPARK_APP_SELECTOR_LABEL, "spark-123")]);
        let patch = pod_mutation("ns1", &existing, true);
        assert_eq!(label_value(&patch, labels::APP_ID_LABEL), None);
        assert_eq!(label_value(&patch, labels::DISABLE_STATE_AWARE_LABEL), None);
    }

    #[test]
    fn existing_state_aware_opt_out_is_preserved() {
        let existing = labels_of(&[(labels::DISABLE_STATE_AWARE_LABEL, "false")]);
        let patch = pod_mutation("ns1", &existing, true);
        assert_eq!(
            label_value(&patch, labels::APP_ID_LABEL),
            Some(json!("yunikorn-ns1-autogen"))
        );
        assert_eq!(
            label_value(&patch, labels::DISABLE_STATE_AWARE_LABEL),
            Some(json!("false"))
        );
    }

    #[test]
    fn default_queue_is_assigned_when_missing() {
        let patch = pod_mutation("ns1", &BTreeMap::new(), true);
        assert_eq!(label_value(&patch, labels::QUEUE_LABEL), Some(json!("root.default")));
    }

    #[test]
    fn existing_queue_is_preserved() {
        let existing = labels_of(&[(labels::QUEUE_LABEL, "root.sandbox")]);
        let patch = pod_mutation("ns1", &existing, true);
        assert_eq!(label_value(&patch, labels::QUEUE_LABEL), Some(json!("root.sandbox")));
    }

    #[test]
    fn labeling_can_be_skipped_entirely() {
        let patch = pod_mutation("ns1", &labels_of(&[("team", "ops")]), false);
        assert_eq!(patch.0.len(), 1);
        match &patch.0[0] {
            PatchOperation::Add(op) => assert_eq!(op.path, "/spec/schedulerName"),
            op => panic!("expected an add operation, got {op:?}"),
        }
    }

    #[test]
    fn patch_serializes_in_operation_order() {
        let patch = pod_mutation("ns1", &BTreeMap::new(), true);
        let value = serde_json::to_value(&patch).expect("patch must serialize");
        let ops = value.as_array().expect("patch must be an array");
        assert_eq!(ops[0]["op"], json!("add"));
        assert_eq!(ops[0]["path"], json!("/spec/schedulerName"));
        assert_eq!(ops[1]["path"], json!("/metadata/labels"));
    }
}
