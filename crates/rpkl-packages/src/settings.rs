//! Package settings
//!
//! Settings are read from `~/.pkl/settings.json` when present, overridden by
//! environment variables, and finally by command line flags.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::module_key::{ModuleKeys, ModulePath};
use crate::packages::{
    DiskCachedPackageResolver, HttpTransport, InMemoryPackageResolver, PackageResolver,
    Transport,
};
use crate::security::{
    SecurityManager, SecurityManagers, StandardSecurityManager, DEFAULT_ALLOWED_MODULES,
    DEFAULT_ALLOWED_RESOURCES,
};

/// Environment variable overriding the cache directory
pub const CACHE_DIR_ENV: &str = "PKL_CACHE_DIR";

/// Name of the settings file inside the PKL home directory
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Settings for package resolution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageSettings {
    /// Cache directory; defaults to `~/.pkl/cache`
    pub cache_dir: Option<PathBuf>,
    /// Keep downloaded packages in memory only
    pub no_cache: bool,
    /// Extra PEM files with trusted CA certificates
    pub ca_certificates: Vec<PathBuf>,
    /// HTTP request timeout in seconds
    pub http_timeout_secs: Option<u64>,
    /// Module allow-list patterns; defaults to [`DEFAULT_ALLOWED_MODULES`]
    pub allowed_modules: Option<Vec<String>>,
    /// Resource allow-list patterns; defaults to [`DEFAULT_ALLOWED_RESOURCES`]
    pub allowed_resources: Option<Vec<String>>,
    /// Restrict file access to this directory
    pub root_dir: Option<PathBuf>,
    /// Root directories for `modulepath:` URIs
    pub module_path: Vec<PathBuf>,
}

/// The PKL home directory, `~/.pkl`
pub fn pkl_home_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".pkl"))
}

impl PackageSettings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("Failed to read {}", path.display()), e))?;
        serde_json::from_str(&json).map_err(|e| {
            Error::InvalidArgument(format!("Invalid settings file {}: {}", path.display(), e))
        })
    }

    /// Load `~/.pkl/settings.json` if it exists, then apply environment overrides
    pub fn load_from_pkl_home_dir() -> Result<Self> {
        let settings = match pkl_home_dir().map(|home| home.join(SETTINGS_FILE_NAME)) {
            Some(path) if path.exists() => {
                tracing::debug!("Loading settings from {}", path.display());
                Self::load(&path)?
            }
            _ => Self::default(),
        };
        Ok(settings.with_env())
    }

    /// Apply overrides from the process environment
    pub fn with_env(self) -> Self {
        self.with_env_from(|name| std::env::var_os(name))
    }

    fn with_env_from(mut self, var: impl Fn(&str) -> Option<OsString>) -> Self {
        if let Some(dir) = var(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// The cache directory in effect, `None` when caching is disabled
    pub fn effective_cache_dir(&self) -> Option<PathBuf> {
        if self.no_cache {
            return None;
        }
        self.cache_dir
            .clone()
            .or_else(|| pkl_home_dir().map(|home| home.join("cache")))
    }

    pub fn security_manager(&self) -> Result<Arc<dyn SecurityManager>> {
        if self.allowed_modules.is_none()
            && self.allowed_resources.is_none()
            && self.root_dir.is_none()
        {
            return Ok(SecurityManagers::standard());
        }

        let modules: Vec<String> = match self.allowed_modules {
            Some(ref patterns) => patterns.clone(),
            None => escaped(DEFAULT_ALLOWED_MODULES),
        };
        let resources: Vec<String> = match self.allowed_resources {
            Some(ref patterns) => patterns.clone(),
            None => escaped(DEFAULT_ALLOWED_RESOURCES),
        };
        let mut manager = StandardSecurityManager::new(modules, resources)?;
        if let Some(ref root_dir) = self.root_dir {
            manager = manager.with_root_dir(root_dir);
        }
        Ok(Arc::new(manager))
    }

    pub fn http_transport(&self) -> Result<HttpTransport> {
        let mut builder = HttpTransport::builder();
        if let Some(secs) = self.http_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        for certificates in &self.ca_certificates {
            builder = builder.add_certificates(certificates);
        }
        builder.build()
    }

    /// Create the package resolver these settings describe
    ///
    /// Disk-backed unless caching is disabled.
    pub fn package_resolver(
        &self,
        transport: Arc<dyn Transport>,
        security: Arc<dyn SecurityManager>,
    ) -> Result<Arc<dyn PackageResolver>> {
        match self.effective_cache_dir() {
            Some(cache_dir) => {
                tracing::debug!("Using package cache {}", cache_dir.display());
                Ok(Arc::new(DiskCachedPackageResolver::new(
                    cache_dir, transport, security,
                )?))
            }
            None => Ok(Arc::new(InMemoryPackageResolver::new(transport, security))),
        }
    }

    /// Module key factory configured with the module path and `resolver`
    pub fn module_keys(&self, resolver: Arc<dyn PackageResolver>) -> ModuleKeys {
        let keys = ModuleKeys::new().with_package_resolver(resolver);
        if self.module_path.is_empty() {
            keys
        } else {
            keys.with_module_path(Arc::new(ModulePath::new(self.module_path.clone())))
        }
    }
}

fn escaped(prefixes: &[&str]) -> Vec<String> {
    prefixes.iter().map(|p| regex::escape(p)).collect()
}
