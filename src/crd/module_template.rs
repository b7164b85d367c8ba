//! ModuleTemplate Custom Resource Definition
//!
//! A ModuleTemplate publishes one version of a module on one channel together
//! with its rendered manifest.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the module name on every ModuleTemplate
pub const MODULE_NAME_LABEL: &str = "operator.kyma-project.io/module-name";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1beta2",
    kind = "ModuleTemplate",
    namespaced,
    shortname = "mt",
    printcolumn = r#"{"name":"Module","type":"string","jsonPath":".spec.moduleName"}"#,
    printcolumn = r#"{"name":"Channel","type":"string","jsonPath":".spec.channel"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleTemplateSpec {
    pub module_name: String,
    pub channel: String,
    pub version: String,

    /// Rendered multi-document YAML or JSON manifest
    pub manifest: String,
}
