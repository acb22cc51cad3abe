use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use kube::core::DynamicObject;
use serde::Deserialize;
use tracing::debug;

use crate::config::AdmissionConfig;

/// Identity carried by the user.info annotation.
#[derive(Debug, Deserialize)]
pub struct UserGroupInfo {
    pub user: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Handles the identity annotation across workload kinds: locating it in the
/// object under review, deciding who may set it, and checking its content.
#[derive(Clone, Debug)]
pub struct UserGroupAnnotationHandler {
    config: Arc<AdmissionConfig>,
}

/// Location of the pod template's annotations within each supported
/// controller kind. Kinds without an entry are none of our business.
fn template_annotations_pointer(kind: &str) -> Option<&'static str> {
    match kind {
        "Deployment" | "ReplicaSet" | "StatefulSet" | "DaemonSet" | "Job" => {
            Some("/spec/template/metadata/annotations")
        }
        "CronJob" => Some("/spec/jobTemplate/spec/template/metadata/annotations"),
        _ => None,
    }
}

impl UserGroupAnnotationHandler {
    pub fn new(config: Arc<AdmissionConfig>) -> Self {
        Self { config }
    }

    /// Extracts the pod template annotations for a workload kind. Returns
    /// `None` for kinds this controller does not understand; an inner error
    /// means the kind is supported but the object could not be read.
    pub fn annotations_from_request_kind(
        &self,
        kind: &str,
        object: Option<&DynamicObject>,
    ) -> Option<Result<BTreeMap<String, String>>> {
        let pointer = template_annotations_pointer(kind)?;
        Some(extract_annotations(object, pointer))
    }

    /// Whether `user` (with `groups`) may set the identity annotation.
    pub fn is_annotation_allowed(&self, user: &str, groups: &[String]) -> bool {
        self.config.external_users.iter().any(|re| re.is_match(user))
            || groups
                .iter()
                .any(|group| self.config.external_groups.iter().any(|re| re.is_match(group)))
    }

    /// Checks the annotation's content: a JSON object naming a user and an
    /// optional group list.
    pub fn is_annotation_valid(&self, value: &str) -> Result<()> {
        let info: UserGroupInfo = serde_json::from_str(value)
            .map_err(|error| anyhow!("invalid user.info annotation: {error}"))?;
        if info.user.is_empty() {
            bail!("invalid user.info annotation: user must not be empty");
        }
        debug!(user = %info.user, groups = ?info.groups, "user.info annotation accepted");
        Ok(())
    }
}

fn extract_annotations(
    object: Option<&DynamicObject>,
    pointer: &str,
) -> Result<BTreeMap<String, String>> {
    let object = object.ok_or_else(|| anyhow!("admission request is missing the workload object"))?;
    match object.data.pointer(pointer) {
        None | Some(serde_json::Value::Null) => Ok(BTreeMap::new()),
        Some(annotations) => serde_json::from_value(annotations.clone())
            .map_err(|error| anyhow!("invalid pod template annotations: {error}")),
    }
}
