use std::path::Path;

use serde::Deserialize;

/// Kind of the datasources that may name their mapping file explicitly.
pub const RUNTIME_KIND: &str = "substrate/Runtime";

const DEFAULT_PROJECT_ENTRY: &str = "./dist";

#[derive(thiserror::Error, Debug)]
pub enum DescriptorError {
    #[error("can not find package.json within directory {0}")]
    MissingPackage(String),

    #[error("invalid package.json in {path}: {source}")]
    InvalidPackage {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingHandler {
    pub handler: String,
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub file: Option<String>,
    #[serde(default)]
    pub handlers: Vec<MappingHandler>,
}

/// The part of a project manifest's datasource entry the sandbox needs to
/// locate mapping code.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceDescriptor {
    pub kind: String,
    pub start_block: Option<u64>,
    #[serde(default)]
    pub mapping: Mapping,
}

impl DatasourceDescriptor {
    /// Module path relative to `root`, always starting with `./` unless the
    /// descriptor names an absolute file.
    ///
    /// The descriptor's shape decides: a runtime datasource with a non-empty
    /// `mapping.file` uses that file, anything else the project's
    /// `package.json` entry.
    ///
    /// # Errors
    /// Returns an error for projects without a readable `package.json` when
    /// the descriptor names no file of its own.
    pub fn module_path(&self, root: &Path) -> Result<String, DescriptorError> {
        match self.explicit_file() {
            Some(file) => Ok(relative(file)),
            None => project_entry(root),
        }
    }

    fn explicit_file(&self) -> Option<&str> {
        if self.kind != RUNTIME_KIND {
            return None;
        }
        self.mapping
            .file
            .as_deref()
            .map(str::trim)
            .filter(|file| !file.is_empty())
    }
}

#[derive(Deserialize)]
struct PackageManifest {
    main: Option<String>,
}

/// Entry file declared by the project's `package.json`.
///
/// # Errors
/// Returns an error if `package.json` is missing or malformed.
pub fn project_entry(root: &Path) -> Result<String, DescriptorError> {
    let manifest_path = root.join("package.json");
    let raw = std::fs::read_to_string(&manifest_path)
        .map_err(|_| DescriptorError::MissingPackage(root.display().to_string()))?;
    let manifest: PackageManifest =
        serde_json::from_str(&raw).map_err(|source| DescriptorError::InvalidPackage {
            path: manifest_path.display().to_string(),
            source,
        })?;
    Ok(manifest
        .main
        .as_deref()
        .map(str::trim)
        .filter(|main| !main.is_empty())
        .map_or_else(|| DEFAULT_PROJECT_ENTRY.to_string(), relative))
}

fn relative(path: &str) -> String {
    if path.starts_with("./") || path.starts_with("../") || path.starts_with('/') {
        path.to_string()
    } else {
        format!("./{path}")
    }
}
