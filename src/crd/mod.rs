//! Custom Resource Definitions for the Kyma lifecycle operator
//!
//! This module defines the Kyma aggregate resource and the ModuleTemplate
//! resource that publishes module versions per channel.

mod kyma;
pub mod module_template;
pub mod types;

pub use kyma::{Kyma, KymaSpec, KymaStatus, SpecValidationError};
pub use module_template::{ModuleTemplate, ModuleTemplateSpec, MODULE_NAME_LABEL};
pub use types::*;
