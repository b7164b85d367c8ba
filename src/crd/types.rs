//! Shared types for the Kyma lifecycle CRDs
//!
//! These types are embedded in the `Kyma` spec and status and are also used
//! directly by the reconciliation engine.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default release channel used when neither the module nor the Kyma names one
pub const DEFAULT_CHANNEL: &str = "regular";

/// Coarse lifecycle state shared by the Kyma resource and each module
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum State {
    #[default]
    Processing,
    Ready,
    Warning,
    Error,
    Deleting,
}

impl State {
    pub const ALL: [State; 5] = [
        State::Processing,
        State::Ready,
        State::Warning,
        State::Error,
        State::Deleting,
    ];

    /// Ordering used when several states compete; higher is more severe
    pub fn severity(&self) -> u8 {
        match self {
            State::Ready => 0,
            State::Processing => 1,
            State::Warning => 2,
            State::Error => 3,
            State::Deleting => 4,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Processing => "Processing",
            State::Ready => "Ready",
            State::Warning => "Warning",
            State::Error => "Error",
            State::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

/// Tri-state status of a condition following Kubernetes API conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Kubernetes-style condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Modules", "RemoteWebhook")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: ConditionStatus,
    /// Last time the condition status changed (RFC 3339)
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// A module requested by a Kyma
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    /// Module name, matched against `ModuleTemplate.spec.moduleName`
    pub name: String,

    /// Release channel; falls back to the Kyma's channel when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Channel that applies to this module given the Kyma-wide default
    pub fn effective_channel<'a>(&'a self, kyma_channel: &'a str) -> &'a str {
        self.channel.as_deref().unwrap_or(kyma_channel)
    }
}

/// Where module resources are synchronized to
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SyncStrategy {
    /// The control-plane cluster itself
    #[default]
    Local,
    /// A runtime cluster whose kubeconfig is stored in `<kyma>-kubeconfig`
    Secret,
}

/// Synchronization target configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Disable to resolve and report without touching any cluster
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub strategy: SyncStrategy,

    /// Namespace given to namespaced objects that omit one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: SyncStrategy::Local,
            namespace: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Identity of an object the engine applied and is responsible for pruning
///
/// The engine manages the lifecycle of the referenced object but does not own
/// its data; only the coordinates are recorded.
#[derive(
    Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "camelCase")]
pub struct SyncedResource {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl SyncedResource {
    /// `apiVersion` string (`group/version`, or just `version` for the core group)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for SyncedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version(), self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version(), self.kind, self.name),
        }
    }
}

/// Reference to the rendered manifest a module was last synchronized from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRef {
    /// `<kyma>-<module>`
    pub name: String,
    /// sha256 (hex) of the rendered manifest bytes
    pub digest: String,
}

/// Observed status of one module
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    pub name: String,

    /// Channel the module was resolved against
    #[serde(default)]
    pub channel: String,

    /// Version the channel resolved to in the latest cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Version of the last manifest that was applied without failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_version: Option<String>,

    #[serde(default)]
    pub state: State,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ManifestRef>,

    /// Objects confirmed applied for this module
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synced: Vec<SyncedResource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Digest of a manifest that could not be decoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_digest: Option<String>,
}

impl ModuleStatus {
    pub fn new(name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
            ..Default::default()
        }
    }
}

/// Summary of the last engine operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    pub operation: String,
    pub last_update_time: String,
}
