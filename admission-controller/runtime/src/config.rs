use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use parking_lot::Mutex;
use regex::Regex;

use crate::core::NamespaceFilter;

/// Name of the ConfigMap carrying shipped scheduler defaults.
pub const DEFAULT_CONFIG_MAP_NAME: &str = "yunikorn-defaults";

/// Name of the ConfigMap carrying operator overrides.
pub const CONFIG_MAP_NAME: &str = "yunikorn-configs";

/// Key selecting the active policy group in the merged configuration.
pub const POLICY_GROUP_KEY: &str = "service.policyGroup";

/// Policy group assumed when the merged configuration names none.
pub const DEFAULT_POLICY_GROUP: &str = "queues";

/// Admission controller configuration, owned for the process lifetime and
/// shared by reference with the request handlers.
///
/// Everything except the ConfigMap slots is immutable after startup. The
/// slots are written on every configuration review, so they sit behind a
/// mutex; [`AdmissionConfig::store_config_map`] returns the updated bundle
/// from under the same lock so an interleaved write for the same name cannot
/// be lost between the store and the read.
#[derive(Debug, Default)]
pub struct AdmissionConfig {
    /// Namespace the scheduler and its configuration live in.
    pub namespace: String,
    /// Skip authorization checks on the identity annotation.
    pub bypass_auth: bool,
    pub filter: NamespaceFilter,
    /// Users allowed to set the identity annotation.
    pub external_users: Vec<Regex>,
    /// Groups allowed to set the identity annotation.
    pub external_groups: Vec<Regex>,
    /// host:port of the scheduler's REST service.
    pub scheduler_service_address: String,
    pub scheduler_timeout: Duration,
    pub config_maps: Mutex<[Option<ConfigMap>; 2]>,
}

/// Slot held by each of the two well-known ConfigMaps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigMapSlot {
    Defaults = 0,
    Overrides = 1,
}

impl ConfigMapSlot {
    pub fn for_name(name: &str) -> Option<Self> {
        match name {
            DEFAULT_CONFIG_MAP_NAME => Some(Self::Defaults),
            CONFIG_MAP_NAME => Some(Self::Overrides),
            _ => None,
        }
    }
}

impl AdmissionConfig {
    /// Stores `config_map` into its slot and returns a snapshot of the full
    /// bundle taken under the same lock.
    pub fn store_config_map(
        &self,
        slot: ConfigMapSlot,
        config_map: ConfigMap,
    ) -> [Option<ConfigMap>; 2] {
        let mut maps = self.config_maps.lock();
        maps[slot as usize] = Some(config_map);
        maps.clone()
    }
}

/// Flattens the bundle into a single key-to-content mapping. Slots are merged
/// in order, so override entries replace default entries on key collision.
pub fn flatten_config_maps(maps: &[Option<ConfigMap>; 2]) -> BTreeMap<String, String> {
    let mut flat = BTreeMap::new();
    for config_map in maps.iter().flatten() {
        if let Some(data) = &config_map.data {
            for (key, value) in data {
                flat.insert(key.clone(), value.clone());
            }
        }
    }
    flat
}

/// Resolves the active policy group from the merged configuration.
pub fn policy_group(flat: &BTreeMap<String, String>) -> &str {
    flat.get(POLICY_GROUP_KEY)
        .map(|group| group.trim())
        .filter(|group| !group.is_empty())
        .unwrap_or(DEFAULT_POLICY_GROUP)
}
