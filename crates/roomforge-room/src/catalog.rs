//! Template catalog: name -> immutable template.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use roomforge_protocol::{PortProtocol, Template};

/// Errors loading or extending the catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read template file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed template JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid template {name:?}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Read-only set of templates rooms are created from.
///
/// Templates are validated on insert and shared as `Arc<Template>`.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, Arc<Template>>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON array of templates.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let templates: Vec<Template> = serde_json::from_str(json)?;
        let mut catalog = Self::new();
        for template in templates {
            catalog.insert(template)?;
        }
        Ok(catalog)
    }

    /// Reads and parses a JSON template file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), templates = catalog.len(), "template catalog loaded");
        Ok(catalog)
    }

    /// Adds a template. Names must be unique.
    pub fn insert(&mut self, template: Template) -> Result<(), CatalogError> {
        validate(&template)?;
        if self.templates.contains_key(&template.name) {
            return Err(invalid(&template, "duplicate template name"));
        }
        self.templates
            .insert(template.name.clone(), Arc::new(template));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Template>> {
        self.templates.get(name).cloned()
    }

    /// All templates, ordered by name.
    pub fn list(&self) -> Vec<Arc<Template>> {
        self.templates.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn invalid(template: &Template, reason: &str) -> CatalogError {
    CatalogError::Invalid {
        name: template.name.clone(),
        reason: reason.to_string(),
    }
}

fn validate(template: &Template) -> Result<(), CatalogError> {
    if template.name.trim().is_empty() {
        return Err(invalid(template, "name is empty"));
    }
    if template.image.trim().is_empty() {
        return Err(invalid(template, "image is empty"));
    }
    // The first port is the proxied endpoint.
    match template.ports.first() {
        None => return Err(invalid(template, "at least one exposed port is required")),
        Some(p) if p.protocol != PortProtocol::Tcp => {
            return Err(invalid(template, "first exposed port must be tcp"));
        }
        Some(_) => {}
    }
    let mut names = HashSet::new();
    if !template.env.iter().all(|v| names.insert(v.name.as_str())) {
        return Err(invalid(template, "duplicate environment variable"));
    }
    if template.resources.cpus.is_some_and(|c| c <= 0.0) {
        return Err(invalid(template, "cpus must be positive"));
    }
    Ok(())
}
