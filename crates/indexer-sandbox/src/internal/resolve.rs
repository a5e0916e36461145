use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use crate::policy::{Capability, SecurityPolicy};

const FILE_EXTENSIONS: [&str; 3] = ["js", "cjs", "json"];
const INDEX_FILES: [&str; 3] = ["index.js", "index.cjs", "index.json"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Capability(Capability),
    Script(PathBuf),
    Json(PathBuf),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ResolveError {
    #[error("module '{0}' is not allowed in this sandbox")]
    Denied(String),

    #[error("cannot load '{0}': path is outside the project root")]
    OutsideRoot(String),

    #[error("cannot find module '{0}'")]
    NotFound(String),
}

/// `require` resolution confined to a canonical project root.
#[derive(Debug)]
pub struct Resolver {
    root: PathBuf,
    policy: Arc<SecurityPolicy>,
}

impl Resolver {
    /// `root` must already be canonical.
    pub const fn new(root: PathBuf, policy: Arc<SecurityPolicy>) -> Self {
        Self { root, policy }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, base_dir: &Path, specifier: &str) -> Result<Resolved, ResolveError> {
        if let Some(capability) = Capability::from_name(specifier) {
            return if self.policy.allows(capability) {
                Ok(Resolved::Capability(capability))
            } else {
                Err(ResolveError::Denied(specifier.to_string()))
            };
        }
        if specifier.is_empty() || specifier.starts_with("node:") {
            return Err(ResolveError::NotFound(specifier.to_string()));
        }

        let base = normalize(base_dir);
        let base = if base.starts_with(&self.root) {
            base
        } else {
            self.root.clone()
        };

        if is_path_like(specifier) {
            let target = normalize(&base.join(specifier));
            if !target.starts_with(&self.root) {
                return Err(ResolveError::OutsideRoot(specifier.to_string()));
            }
            let file = self
                .load(&target)
                .ok_or_else(|| ResolveError::NotFound(specifier.to_string()))?;
            return self.classify(specifier, &file);
        }

        for dir in base.ancestors() {
            if !dir.starts_with(&self.root) {
                break;
            }
            let target = normalize(&dir.join("node_modules").join(specifier));
            if !target.starts_with(&self.root) {
                return Err(ResolveError::OutsideRoot(specifier.to_string()));
            }
            if let Some(file) = self.load(&target) {
                return self.classify(specifier, &file);
            }
        }
        Err(ResolveError::NotFound(specifier.to_string()))
    }

    /// Maps a path used by sandboxed filesystem helpers onto the host,
    /// relative paths being taken from the root.
    pub fn confine(&self, path: &str) -> Result<PathBuf, ResolveError> {
        let target = normalize(&self.root.join(path));
        if !target.starts_with(&self.root) {
            return Err(ResolveError::OutsideRoot(path.to_string()));
        }
        match target.canonicalize() {
            Ok(real) if real.starts_with(&self.root) => Ok(real),
            Ok(_) => Err(ResolveError::OutsideRoot(path.to_string())),
            // not there yet; callers surface their own io error
            Err(_) => Ok(target),
        }
    }

    fn load(&self, target: &Path) -> Option<PathBuf> {
        load_file(target).or_else(|| self.load_directory(target))
    }

    fn load_directory(&self, dir: &Path) -> Option<PathBuf> {
        if !dir.is_dir() {
            return None;
        }
        if let Some(main) = package_main(dir) {
            let target = normalize(&dir.join(main));
            if target.starts_with(&self.root) {
                let found = load_file(&target).or_else(|| load_index(&target));
                if found.is_some() {
                    return found;
                }
            }
        }
        load_index(dir)
    }

    fn classify(&self, specifier: &str, file: &Path) -> Result<Resolved, ResolveError> {
        let real = file
            .canonicalize()
            .map_err(|_| ResolveError::NotFound(specifier.to_string()))?;
        if !real.starts_with(&self.root) {
            return Err(ResolveError::OutsideRoot(specifier.to_string()));
        }
        if real.extension().is_some_and(|ext| ext == "json") {
            Ok(Resolved::Json(real))
        } else {
            Ok(Resolved::Script(real))
        }
    }
}

fn is_path_like(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier.starts_with('/')
}

fn load_file(target: &Path) -> Option<PathBuf> {
    if target.is_file() {
        return Some(target.to_path_buf());
    }
    let name = target.file_name()?.to_str()?;
    FILE_EXTENSIONS
        .iter()
        .map(|ext| target.with_file_name(format!("{name}.{ext}")))
        .find(|candidate| candidate.is_file())
}

fn load_index(dir: &Path) -> Option<PathBuf> {
    INDEX_FILES
        .iter()
        .map(|index| dir.join(index))
        .find(|candidate| candidate.is_file())
}

fn package_main(dir: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(dir.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&raw).ok()?;
    manifest
        .get("main")?
        .as_str()
        .filter(|main| !main.is_empty())
        .map(str::to_string)
}

/// Lexical normalization: drops `.` and folds `..` without touching the
/// filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
