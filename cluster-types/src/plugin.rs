// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The pluggable addon configuration contract and its dependency
//! validation.
//!
//! Addon implementations live outside this workspace; what crosses the
//! boundary is a configuration record (is the addon requested, under which
//! license labels, with which named prerequisites) and the validation that
//! runs over a cluster spec before any plan is built.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A bitmask of license labels. An addon gated on labels may only be
/// enabled when the cluster's license mask contains every required bit.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct LicenseMask(pub u64);

impl LicenseMask {
    /// The empty mask; addons requiring it are never license-gated.
    pub const NONE: LicenseMask = LicenseMask(0);

    pub fn contains(&self, required: LicenseMask) -> bool {
        self.0 & required.0 == required.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for LicenseMask {
    type Output = LicenseMask;

    fn bitor(self, rhs: LicenseMask) -> LicenseMask {
        LicenseMask(self.0 | rhs.0)
    }
}

/// Lifecycle state of one plugin as persisted in the cluster record.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    NotInstalled,
    Installing,
    Running,
    Failed,
    Removed,
}

/// The capability set any pluggable addon configuration exposes.
pub trait Pluggable {
    fn enabled(&self) -> bool;
    fn name(&self) -> &str;
    fn status(&self) -> PluginStatus;
    /// Named prerequisites: `None` means the dependency is absent from the
    /// cluster spec entirely.
    fn dependencies(&self) -> BTreeMap<String, Option<&dyn Pluggable>>;
    fn license_labels(&self) -> LicenseMask;
}

/// Validation failure for an enabled plugin whose prerequisites are not
/// satisfied. Every offending dependency is listed, not just the first.
#[derive(Clone, Debug, Error)]
#[error("plugin {plugin:?} has unsatisfied dependencies: {}", unsatisfied.join(", "))]
pub struct DependencyCheckError {
    pub plugin: String,
    pub unsatisfied: Vec<String>,
}

/// Validates an addon configuration's dependencies.
///
/// A disabled plugin always passes, regardless of what its dependency map
/// contains. An enabled plugin fails with an aggregated error naming every
/// dependency that is absent or present but disabled.
pub fn check_dependencies(
    plugin: &dyn Pluggable,
) -> Result<(), DependencyCheckError> {
    if !plugin.enabled() {
        return Ok(());
    }
    let mut unsatisfied = Vec::new();
    for (name, dep) in plugin.dependencies() {
        match dep {
            None => unsatisfied.push(format!("{name} (absent)")),
            Some(dep) if !dep.enabled() => {
                unsatisfied.push(format!("{name} (disabled)"))
            }
            Some(_) => {}
        }
    }
    if unsatisfied.is_empty() {
        Ok(())
    } else {
        Err(DependencyCheckError {
            plugin: plugin.name().to_string(),
            unsatisfied,
        })
    }
}

/// A concrete, persistable plugin configuration.
///
/// `requires` names other plugins in the same cluster record; resolve it
/// against the record with [`ResolvedPlugin`] before running
/// [`check_dependencies`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct PluginConfig {
    pub name: String,
    pub enabled: bool,
    pub status: PluginStatus,
    pub license_labels: LicenseMask,
    pub requires: Vec<String>,
    /// Addon-specific settings, opaque to the engine.
    pub settings: serde_json::Value,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
            status: PluginStatus::NotInstalled,
            license_labels: LicenseMask::NONE,
            requires: Vec::new(),
            settings: serde_json::Value::Null,
        }
    }

    /// Binds this configuration to its sibling set so dependency lookups
    /// resolve.
    pub fn resolved<'a>(
        &'a self,
        siblings: &'a BTreeMap<String, PluginConfig>,
    ) -> ResolvedPlugin<'a> {
        ResolvedPlugin { config: self, siblings }
    }
}

impl Pluggable for PluginConfig {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> PluginStatus {
        self.status
    }

    fn dependencies(&self) -> BTreeMap<String, Option<&dyn Pluggable>> {
        // A bare config cannot see its siblings; resolve it first.
        self.requires.iter().map(|name| (name.clone(), None)).collect()
    }

    fn license_labels(&self) -> LicenseMask {
        self.license_labels
    }
}

/// A [`PluginConfig`] viewed against the full plugin set of its cluster
/// record, so `dependencies()` can find the actual sibling configurations.
pub struct ResolvedPlugin<'a> {
    config: &'a PluginConfig,
    siblings: &'a BTreeMap<String, PluginConfig>,
}

impl fmt::Debug for ResolvedPlugin<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedPlugin")
            .field("config", &self.config)
            .finish()
    }
}

impl Pluggable for ResolvedPlugin<'_> {
    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn status(&self) -> PluginStatus {
        self.config.status
    }

    fn dependencies(&self) -> BTreeMap<String, Option<&dyn Pluggable>> {
        self.config
            .requires
            .iter()
            .map(|name| {
                let dep = self
                    .siblings
                    .get(name)
                    .map(|config| config as &dyn Pluggable);
                (name.clone(), dep)
            })
            .collect()
    }

    fn license_labels(&self) -> LicenseMask {
        self.config.license_labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_plugin_always_passes() {
        let mut plugin = PluginConfig::new("console", false);
        plugin.requires = vec!["platform-services".to_string()];
        let siblings = BTreeMap::new();
        assert!(check_dependencies(&plugin.resolved(&siblings)).is_ok());
    }

    #[test]
    fn enabled_plugin_reports_every_unsatisfied_dependency() {
        let mut siblings = BTreeMap::new();
        siblings.insert(
            "platform-services".to_string(),
            PluginConfig::new("platform-services", false),
        );

        let mut plugin = PluginConfig::new("console", true);
        plugin.requires = vec![
            "platform-services".to_string(),
            "storage-provider".to_string(),
        ];

        let err = check_dependencies(&plugin.resolved(&siblings))
            .expect_err("both dependencies are unsatisfied");
        assert_eq!(err.plugin, "console");
        let message = err.to_string();
        assert!(
            message.contains("platform-services")
                && message.contains("storage-provider"),
            "error should list both dependencies: {message}"
        );
    }

    #[test]
    fn satisfied_dependencies_pass() {
        let mut siblings = BTreeMap::new();
        siblings.insert(
            "platform-services".to_string(),
            PluginConfig::new("platform-services", true),
        );
        let mut plugin = PluginConfig::new("console", true);
        plugin.requires = vec!["platform-services".to_string()];
        assert!(check_dependencies(&plugin.resolved(&siblings)).is_ok());
    }

    #[test]
    fn license_mask_containment() {
        let base = LicenseMask(0b0011);
        assert!(base.contains(LicenseMask(0b0001)));
        assert!(base.contains(LicenseMask::NONE));
        assert!(!base.contains(LicenseMask(0b0100)));
    }
}
