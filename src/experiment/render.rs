//! Pipeline config rendering seam.
//!
//! The store never learns which collector flavor produced a config; the
//! variant is observable only through the template name.

use std::collections::HashMap;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::error::EngineError;

/// A rendered pipeline configuration plus its content checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub yaml: String,
    /// Hex SHA-256 of the rendered text.
    pub checksum: String,
}

/// Renders a named template with a set of variables.
pub trait ConfigRenderer: Send + Sync {
    fn render(
        &self,
        template_name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedConfig, EngineError>;
}

/// File-based renderer: reads `<dir>/<template>.yaml` and substitutes
/// `${name}` placeholders.
pub struct TemplateDirRenderer {
    dir: PathBuf,
}

impl TemplateDirRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ConfigRenderer for TemplateDirRenderer {
    fn render(
        &self,
        template_name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedConfig, EngineError> {
        // Template names come from clients; keep them inside the directory.
        if template_name.contains(['/', '\\']) || template_name.contains("..") {
            return Err(EngineError::Render {
                template: template_name.to_string(),
                reason: "template name must not contain path separators".to_string(),
            });
        }
        let path = self.dir.join(format!("{template_name}.yaml"));
        let template = std::fs::read_to_string(&path).map_err(|e| EngineError::Render {
            template: template_name.to_string(),
            reason: format!("{}: {e}", path.display()),
        })?;

        let yaml = substitute(&template, variables);
        if let Some(missing) = find_placeholder(&yaml) {
            return Err(EngineError::Render {
                template: template_name.to_string(),
                reason: format!("unbound template variable '{missing}'"),
            });
        }

        Ok(RenderedConfig {
            checksum: checksum(&yaml),
            yaml,
        })
    }
}

fn substitute(template: &str, variables: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (name, value) in variables {
        rendered = rendered.replace(&format!("${{{name}}}"), value);
    }
    rendered
}

/// First `${...}` placeholder left in the rendered text, if any.
fn find_placeholder(rendered: &str) -> Option<String> {
    let start = rendered.find("${")?;
    let rest = &rendered[start + 2..];
    let end = rest.find('}')?;
    Some(rest[..end].to_string())
}

fn checksum(yaml: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(yaml.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
