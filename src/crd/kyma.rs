//! Kyma Custom Resource Definition
//!
//! A Kyma declares which modules, on which release channel, should be active
//! for one tenant runtime. Its status is written only by the operator.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, LastOperation, Module, ModuleStatus, State, SyncConfig, DEFAULT_CHANNEL,
};

/// Structured validation error for `KymaSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1beta2",
    kind = "Kyma",
    namespaced,
    status = "KymaStatus",
    shortname = "kyma",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Channel","type":"string","jsonPath":".spec.channel"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KymaSpec {
    /// Default release channel for modules that do not name one
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Desired modules, in declaration order
    #[serde(default)]
    pub modules: Vec<Module>,

    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

impl KymaSpec {
    /// Validate the spec before any resolution happens
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if self.channel.trim().is_empty() {
            return Err(SpecValidationError::new(
                "spec.channel",
                "channel must not be empty",
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for (idx, module) in self.modules.iter().enumerate() {
            if module.name.trim().is_empty() {
                return Err(SpecValidationError::new(
                    format!("spec.modules[{idx}].name"),
                    "module name must not be empty",
                ));
            }
            if !seen.insert(module.name.as_str()) {
                return Err(SpecValidationError::new(
                    format!("spec.modules[{idx}].name"),
                    format!("module {} is listed more than once", module.name),
                ));
            }
            if let Some(channel) = &module.channel {
                if channel.trim().is_empty() {
                    return Err(SpecValidationError::new(
                        format!("spec.modules[{idx}].channel"),
                        "channel must not be empty when set",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Status subresource of a Kyma
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KymaStatus {
    /// Aggregated state, derived from `modules` and `conditions`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<ModuleStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
}

impl KymaStatus {
    pub fn module(&self, name: &str) -> Option<&ModuleStatus> {
        self.modules.iter().find(|m| m.name == name)
    }
}

impl Kyma {
    /// Whether deletion was requested for this Kyma
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// The last written status, or an empty one
    pub fn current_status(&self) -> KymaStatus {
        self.status.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(modules: Vec<Module>) -> KymaSpec {
        KymaSpec {
            channel: "regular".to_string(),
            modules,
            sync: SyncConfig::default(),
        }
    }

    #[test]
    fn test_validate_accepts_distinct_modules() {
        let spec = spec(vec![
            Module::new("keda").with_channel("fast"),
            Module::new("serverless"),
        ]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_module() {
        let spec = spec(vec![Module::new("keda"), Module::new("keda")]);
        let err = spec.validate().unwrap_err();
        assert_eq!(err.field, "spec.modules[1].name");
    }

    #[test]
    fn test_validate_rejects_empty_channel_override() {
        let spec = spec(vec![Module::new("keda").with_channel(" ")]);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_defaults_from_yaml() {
        let spec: KymaSpec = serde_yaml::from_str("modules:\n  - name: keda\n").unwrap();
        assert_eq!(spec.channel, DEFAULT_CHANNEL);
        assert_eq!(spec.modules.len(), 1);
        assert!(spec.sync.enabled);
    }
}
