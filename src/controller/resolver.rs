//! Module descriptor resolution
//!
//! Turns a `(module, channel)` reference into a concrete version and its
//! rendered manifest bytes.

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, instrument};

use crate::crd::{ModuleTemplate, MODULE_NAME_LABEL};
use crate::error::{Error, Result};

/// A module reference resolved to one published version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedModule {
    pub version: String,
    /// Rendered multi-document manifest
    pub manifest: String,
}

/// Resolves module references to descriptors
///
/// Implementations return [`Error::ChannelResolution`] when the reference
/// cannot be satisfied by configuration (unknown module or channel) and
/// other errors for transient failures.
#[async_trait]
pub trait DescriptorResolver: Send + Sync {
    async fn resolve(&self, module: &str, channel: &str) -> Result<ResolvedModule>;
}

/// Resolver backed by `ModuleTemplate` resources in one namespace
pub struct ModuleTemplateResolver {
    api: Api<ModuleTemplate>,
}

impl ModuleTemplateResolver {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl DescriptorResolver for ModuleTemplateResolver {
    #[instrument(skip(self))]
    async fn resolve(&self, module: &str, channel: &str) -> Result<ResolvedModule> {
        let lp = ListParams::default().labels(&format!("{MODULE_NAME_LABEL}={module}"));
        let templates = self.api.list(&lp).await?;
        debug!(
            "Found {} ModuleTemplate(s) for module {}",
            templates.items.len(),
            module
        );
        select_template(module, channel, &templates.items)
    }
}

/// Pick the single template publishing `module` on `channel`
pub fn select_template(
    module: &str,
    channel: &str,
    templates: &[ModuleTemplate],
) -> Result<ResolvedModule> {
    let matches: Vec<&ModuleTemplate> = templates
        .iter()
        .filter(|t| t.spec.module_name == module && t.spec.channel == channel)
        .collect();

    match matches.as_slice() {
        [template] => Ok(ResolvedModule {
            version: template.spec.version.clone(),
            manifest: template.spec.manifest.clone(),
        }),
        [] => {
            let mut available: Vec<&str> = templates
                .iter()
                .filter(|t| t.spec.module_name == module)
                .map(|t| t.spec.channel.as_str())
                .collect();
            available.sort_unstable();
            available.dedup();
            let reason = if available.is_empty() {
                "no ModuleTemplate published for this module".to_string()
            } else {
                format!("available channels: {}", available.join(", "))
            };
            Err(Error::ChannelResolution {
                module: module.to_string(),
                channel: channel.to_string(),
                reason,
            })
        }
        many => Err(Error::ChannelResolution {
            module: module.to_string(),
            channel: channel.to_string(),
            reason: format!("{} ModuleTemplates are ambiguous", many.len()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ModuleTemplateSpec;

    fn template(module: &str, channel: &str, version: &str) -> ModuleTemplate {
        ModuleTemplate::new(
            &format!("{module}-{channel}"),
            ModuleTemplateSpec {
                module_name: module.to_string(),
                channel: channel.to_string(),
                version: version.to_string(),
                manifest: String::new(),
            },
        )
    }

    #[test]
    fn test_select_template_by_channel() {
        let templates = vec![
            template("keda", "fast", "2.15.0"),
            template("keda", "regular", "2.14.1"),
        ];
        let resolved = select_template("keda", "regular", &templates).unwrap();
        assert_eq!(resolved.version, "2.14.1");
    }

    #[test]
    fn test_unknown_channel_is_configuration_error() {
        let templates = vec![template("keda", "fast", "2.15.0")];
        let err = select_template("keda", "stable", &templates).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("available channels: fast"));
    }

    #[test]
    fn test_ambiguous_templates_rejected() {
        let templates = vec![
            template("keda", "fast", "2.15.0"),
            template("keda", "fast", "2.15.1"),
        ];
        let err = select_template("keda", "fast", &templates).unwrap_err();
        assert!(matches!(err, Error::ChannelResolution { .. }));
        assert!(err.to_string().contains("ambiguous"));
    }
}
