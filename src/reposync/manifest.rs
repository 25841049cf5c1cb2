//! Declarative manifest parsing for templates and plugins.
//!
//! Manifests originate from external Git repositories and are untrusted:
//! structure is validated, unknown `kind`/`apiVersion` values are rejected,
//! and the catalog stores a JSON-encoded copy for later use without ever
//! executing it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::storage::{CatalogEntry, InstallStatus};

/// API versions this control plane understands.
pub const ACCEPTED_API_VERSIONS: &[&str] = &["streaming.dev/v1", "streaming.dev/v1alpha1"];

/// Why a file was skipped rather than imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Not parseable as YAML/JSON at all.
    Unparseable(String),
    /// Parsed, but not a `Template` document.
    WrongKind(String),
    /// A `Template` with an apiVersion this server does not accept.
    UnknownApiVersion(String),
    /// Structurally a template but missing a required field.
    MissingField(&'static str),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unparseable(err) => write!(f, "unparseable: {err}"),
            Self::WrongKind(kind) => write!(f, "kind {kind:?} is not Template"),
            Self::UnknownApiVersion(v) => write!(f, "unknown apiVersion {v:?}"),
            Self::MissingField(field) => write!(f, "missing required field {field}"),
        }
    }
}

/// A template manifest (`kind: Template`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: TemplateMetadata,
    pub spec: TemplateSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub name: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub image: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Explicit type wins over derivation.
    #[serde(rename = "appType", default)]
    pub app_type: Option<String>,
    /// Web-app sub-section; presence implies `webapp` when the type is not
    /// explicit.
    #[serde(default)]
    pub web: Option<Value>,
    /// Desktop/VNC sub-section.
    #[serde(default)]
    pub vnc: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_platform() -> String {
    "kubernetes".to_string()
}

impl TemplateManifest {
    /// Parses one YAML document, deciding whether it is an importable
    /// template. Non-template documents and unknown versions are skips,
    /// not errors: other files in the tree may still be templates.
    pub fn parse_yaml(src: &str) -> Result<Self, SkipReason> {
        let raw: Value = serde_yaml::from_str(src)
            .map_err(|e| SkipReason::Unparseable(e.to_string()))?;

        let kind = raw.get("kind").and_then(Value::as_str).unwrap_or_default();
        if kind != "Template" {
            return Err(SkipReason::WrongKind(kind.to_string()));
        }

        let api_version = raw
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !ACCEPTED_API_VERSIONS.contains(&api_version) {
            return Err(SkipReason::UnknownApiVersion(api_version.to_string()));
        }

        let manifest: Self = serde_json::from_value(raw)
            .map_err(|e| SkipReason::Unparseable(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), SkipReason> {
        if self.metadata.name.trim().is_empty() {
            return Err(SkipReason::MissingField("metadata.name"));
        }
        if self.spec.image.trim().is_empty() {
            return Err(SkipReason::MissingField("spec.image"));
        }
        Ok(())
    }

    /// Application type: explicit field wins, else a `web` sub-section
    /// means `webapp`, else desktop.
    #[must_use]
    pub fn app_type(&self) -> &str {
        if let Some(explicit) = self.spec.app_type.as_deref() {
            return explicit;
        }
        if self.spec.web.is_some() {
            return "webapp";
        }
        "desktop"
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        self.metadata
            .display_name
            .as_deref()
            .unwrap_or(&self.metadata.name)
    }

    /// Converts to a catalog entry owned by `repository_id`.
    #[must_use]
    pub fn to_catalog_entry(&self, repository_id: Uuid) -> CatalogEntry {
        CatalogEntry {
            id: Uuid::new_v4(),
            repository_id,
            name: self.metadata.name.clone(),
            display_name: self.display_name().to_string(),
            description: self.metadata.description.clone(),
            category: self.metadata.category.clone(),
            app_type: self.app_type().to_string(),
            icon_url: self.metadata.icon.clone(),
            manifest: serde_json::to_value(self).unwrap_or(Value::Null),
            tags: self.metadata.tags.clone(),
            install_count: 0,
            install_status: InstallStatus::Available,
        }
    }
}

/// A plugin manifest (`manifest.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PluginManifest {
    /// Parses `manifest.json` content; missing `name`/`version` skip the
    /// file.
    pub fn parse_json(src: &str) -> Result<Self, SkipReason> {
        let manifest: Self = serde_json::from_str(src)
            .map_err(|e| SkipReason::Unparseable(e.to_string()))?;
        if manifest.name.trim().is_empty() {
            return Err(SkipReason::MissingField("name"));
        }
        if manifest.version.trim().is_empty() {
            return Err(SkipReason::MissingField("version"));
        }
        Ok(manifest)
    }

    #[must_use]
    pub fn to_catalog_entry(&self, repository_id: Uuid) -> CatalogEntry {
        CatalogEntry {
            id: Uuid::new_v4(),
            repository_id,
            name: self.name.clone(),
            display_name: self.name.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
            app_type: "webapp".to_string(),
            icon_url: self.icon.clone(),
            manifest: serde_json::to_value(self).unwrap_or(Value::Null),
            tags: self.tags.clone(),
            install_count: 0,
            install_status: InstallStatus::Available,
        }
    }
}
