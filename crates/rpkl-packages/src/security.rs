//! Security policy for module and resource resolution
//!
//! Every module resolution, import edge and package fetch is authorized by a
//! [`SecurityManager`] before any I/O happens.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use regex::Regex;

use crate::error::{Error, Result};
use crate::uri::Uri;

/// Module URI patterns allowed by default
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "repl:",
    "file:",
    "jar:file:",
    "modulepath:",
    "https:",
    "pkl:",
    "package:",
    "projectpackage:",
];

/// Resource URI patterns allowed by default
pub const DEFAULT_ALLOWED_RESOURCES: &[&str] = &[
    "env:",
    "prop:",
    "file:",
    "modulepath:",
    "https:",
    "package:",
    "projectpackage:",
];

/// Authorizes module and resource access
pub trait SecurityManager: Send + Sync {
    /// Check that a module URI may be resolved (and fetched)
    fn check_resolve_module(&self, uri: &Uri) -> Result<()>;

    /// Check that `importing` may import `imported`
    fn check_import_module(&self, importing: &Uri, imported: &Uri) -> Result<()>;

    /// Check that a resource URI may be read
    fn check_read_resource(&self, uri: &Uri) -> Result<()>;

    /// Check that a resource URI may be resolved
    fn check_resolve_resource(&self, uri: &Uri) -> Result<()>;
}

/// Security manager with allow-lists, trust levels and an optional root directory
#[derive(Debug, Clone)]
pub struct StandardSecurityManager {
    allowed_modules: Vec<Regex>,
    allowed_resources: Vec<Regex>,
    root_dir: Option<PathBuf>,
}

impl StandardSecurityManager {
    /// Create a security manager from allow-list patterns
    ///
    /// Patterns are regular expressions matched against the start of a URI.
    pub fn new<M, R>(allowed_modules: M, allowed_resources: R) -> Result<Self>
    where
        M: IntoIterator,
        M::Item: AsRef<str>,
        R: IntoIterator,
        R::Item: AsRef<str>,
    {
        Ok(Self {
            allowed_modules: compile_patterns(allowed_modules)?,
            allowed_resources: compile_patterns(allowed_resources)?,
            root_dir: None,
        })
    }

    /// Restrict `file:` URIs to the given directory
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(lexical_normalize(&root_dir.into()));
        self
    }

    fn check_root_dir(&self, uri: &Uri, kind: &str) -> Result<()> {
        let Some(ref root_dir) = self.root_dir else {
            return Ok(());
        };
        let path = match uri.scheme() {
            Some(s) if s.eq_ignore_ascii_case("file") => uri.to_path()?,
            Some(s) if s.eq_ignore_ascii_case("jar") => jar_file_path(uri),
            _ => None,
        };
        match path {
            Some(path) if !lexical_normalize(&path).starts_with(root_dir) => {
                Err(Error::Security(format!(
                    "Refusing to load {} `{}` because it is not within the root directory (`--root-dir`).",
                    kind, uri
                )))
            }
            _ => Ok(()),
        }
    }
}

impl SecurityManager for StandardSecurityManager {
    fn check_resolve_module(&self, uri: &Uri) -> Result<()> {
        let text = uri.to_string();
        if !self.allowed_modules.iter().any(|p| p.is_match(&text)) {
            tracing::debug!("Module {} denied by allow-list", text);
            return Err(Error::Security(format!(
                "Refusing to load module `{}` because it does not match any entry in the module allowlist (`--allowed-modules`).",
                text
            )));
        }
        self.check_root_dir(uri, "module")
    }

    fn check_import_module(&self, importing: &Uri, imported: &Uri) -> Result<()> {
        let importing_level = trust_level(importing);
        let imported_level = trust_level(imported);
        if imported_level > importing_level {
            return Err(Error::Security(format!(
                "Refusing to import module `{}` from module `{}` because the imported module has a higher trust level than the importing module.",
                imported, importing
            )));
        }
        Ok(())
    }

    fn check_read_resource(&self, uri: &Uri) -> Result<()> {
        let text = uri.to_string();
        if !self.allowed_resources.iter().any(|p| p.is_match(&text)) {
            return Err(Error::Security(format!(
                "Refusing to read resource `{}` because it does not match any entry in the resource allowlist (`--allowed-resources`).",
                text
            )));
        }
        self.check_root_dir(uri, "resource")
    }

    fn check_resolve_resource(&self, uri: &Uri) -> Result<()> {
        self.check_read_resource(uri)
    }
}

/// Security manager that allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrestricted;

impl SecurityManager for Unrestricted {
    fn check_resolve_module(&self, _uri: &Uri) -> Result<()> {
        Ok(())
    }

    fn check_import_module(&self, _importing: &Uri, _imported: &Uri) -> Result<()> {
        Ok(())
    }

    fn check_read_resource(&self, _uri: &Uri) -> Result<()> {
        Ok(())
    }

    fn check_resolve_resource(&self, _uri: &Uri) -> Result<()> {
        Ok(())
    }
}

/// Factory functions for common security managers
pub struct SecurityManagers;

impl SecurityManagers {
    /// The default policy: default allow-lists, no root directory
    pub fn standard() -> Arc<dyn SecurityManager> {
        Arc::new(StandardSecurityManager {
            allowed_modules: default_patterns(DEFAULT_ALLOWED_MODULES),
            allowed_resources: default_patterns(DEFAULT_ALLOWED_RESOURCES),
            root_dir: None,
        })
    }

    pub fn unrestricted() -> Arc<dyn SecurityManager> {
        Arc::new(Unrestricted)
    }
}

fn compile_patterns<I>(patterns: I) -> Result<Vec<Regex>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|pattern| {
            let pattern = pattern.as_ref();
            Regex::new(&format!("^(?:{})", pattern)).map_err(|e| {
                Error::InvalidArgument(format!("Invalid allow-list pattern `{}`: {}", pattern, e))
            })
        })
        .collect()
}

fn default_patterns(prefixes: &[&str]) -> Vec<Regex> {
    prefixes
        .iter()
        .filter_map(|prefix| Regex::new(&format!("^(?:{})", regex::escape(prefix))).ok())
        .collect()
}

/// Trust level of a module URI; a module may only import modules of equal or
/// lower trust
fn trust_level(uri: &Uri) -> u8 {
    match uri.scheme().map(str::to_ascii_lowercase).as_deref() {
        Some("repl") => 40,
        Some("file") if uri.host().map_or(true, str::is_empty) => 30,
        Some("file") => 10,
        Some("jar") => 30,
        Some("modulepath") => 20,
        Some("pkl") => 0,
        _ => 10,
    }
}

/// Path of the archive in a `jar:file:...!/entry` URI
fn jar_file_path(uri: &Uri) -> Option<PathBuf> {
    let inner = uri.path().split('!').next()?;
    Uri::parse(inner).ok()?.to_path().ok().flatten()
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
