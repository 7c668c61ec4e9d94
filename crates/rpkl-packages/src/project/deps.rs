//! PklProject.deps.json parsing
//!
//! This file contains resolved dependencies for a PKL project.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::packages::{Checksums, PackageAssetUri, PackageUri};

/// Schema version for PklProject.deps.json
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the resolution manifest
pub const DEPS_FILE_NAME: &str = "PklProject.deps.json";

/// Resolved project dependencies from PklProject.deps.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDeps {
    /// Schema version
    pub schema_version: u32,

    /// Map of canonical package URI to resolved dependency, in first-declaration order
    pub resolved_dependencies: IndexMap<String, ResolvedDependency>,
}

/// A resolved dependency entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResolvedDependency {
    /// A remote dependency (downloaded from a package server)
    #[serde(rename = "remote")]
    Remote {
        /// The resolved projectpackage:// URI
        uri: String,
        /// Checksums of the package metadata
        checksums: Checksums,
    },

    /// A local dependency (relative path to another project)
    #[serde(rename = "local")]
    Local {
        /// The resolved projectpackage:// URI
        uri: String,
        /// Path to the local project, relative to the resolving project
        path: String,
    },
}

/// Where a `projectpackage:` asset actually lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAsset {
    /// Asset of a remote package, pinned to the resolved checksum
    Remote(PackageAssetUri),
    /// File inside a local project
    Local(PathBuf),
}

impl ResolvedDependency {
    /// Get the resolved URI
    pub fn uri(&self) -> &str {
        match self {
            ResolvedDependency::Remote { uri, .. } => uri,
            ResolvedDependency::Local { uri, .. } => uri,
        }
    }

    /// Check if this is a remote dependency
    pub fn is_remote(&self) -> bool {
        matches!(self, ResolvedDependency::Remote { .. })
    }

    /// Get checksums if this is a remote dependency
    pub fn checksums(&self) -> Option<&Checksums> {
        match self {
            ResolvedDependency::Remote { checksums, .. } => Some(checksums),
            ResolvedDependency::Local { .. } => None,
        }
    }
}

impl Default for ProjectDeps {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            resolved_dependencies: IndexMap::new(),
        }
    }
}

impl ProjectDeps {
    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let deps: ProjectDeps = serde_json::from_str(json).map_err(|e| {
            Error::InvalidProject(format!("Failed to parse {}: {}", DEPS_FILE_NAME, e))
        })?;

        if deps.schema_version != SCHEMA_VERSION {
            return Err(Error::InvalidProject(format!(
                "Unsupported {} schema version: {}. Expected: {}",
                DEPS_FILE_NAME, deps.schema_version, SCHEMA_VERSION
            )));
        }

        Ok(deps)
    }

    /// Load from a file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("Failed to read {}", path.display()), e))?;
        Self::from_json(&content)
    }

    /// Find the deps.json file starting from a given directory
    ///
    /// Searches upward through parent directories for PklProject.deps.json
    pub fn find_and_load(start_dir: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut current = start_dir.to_path_buf();

        loop {
            let deps_file = current.join(DEPS_FILE_NAME);
            if deps_file.exists() {
                let deps = Self::load(&deps_file)?;
                return Ok(Some((deps, deps_file)));
            }

            if !current.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Resolve a canonical package URI to its full resolved URI
    ///
    /// The canonical URI is in the format: `package://authority/path@majorVersion`
    pub fn resolve(&self, canonical_uri: &str) -> Option<&ResolvedDependency> {
        self.resolved_dependencies.get(canonical_uri)
    }

    /// Map a `projectpackage:` asset to the package asset or file it stands for
    ///
    /// `project_dir` is the directory of the project this manifest belongs to.
    pub fn resolve_asset(&self, asset: &PackageAssetUri, project_dir: &Path) -> Result<ResolvedAsset> {
        let canonical = asset.package.canonical().to_string();
        let dependency = self.resolve(&canonical).ok_or_else(|| {
            Error::Resolution(format!(
                "Cannot resolve `{}` because the project has no resolved dependency `{}`. Try resolving the project's dependencies again.",
                asset, canonical
            ))
        })?;

        match dependency {
            ResolvedDependency::Remote { uri, checksums } => {
                let mut package = PackageUri::parse(uri)?.to_package();
                package.checksums = Some(checksums.clone());
                Ok(ResolvedAsset::Remote(PackageAssetUri::new(
                    package,
                    &asset.asset_path,
                )?))
            }
            ResolvedDependency::Local { path, .. } => {
                let mut file = project_dir.join(path);
                let relative = asset.relative_path();
                if !relative.is_empty() {
                    file.push(&*relative);
                }
                Ok(ResolvedAsset::Local(file))
            }
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::io(format!("Failed to serialize {}", DEPS_FILE_NAME), e))
    }

    /// Write the JSON form to a writer
    pub fn write_to(&self, mut writer: impl Write) -> Result<()> {
        let json = self.to_json()?;
        writer
            .write_all(json.as_bytes())
            .map_err(|e| Error::io(format!("Failed to write {}", DEPS_FILE_NAME), e))
    }

    /// Write the manifest to a file, replacing it atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| Error::io(format!("Failed to create temp file in {}", dir.display()), e))?;
        self.write_to(&mut tmp)?;
        tmp.write_all(b"\n")
            .map_err(|e| Error::io(format!("Failed to write {}", path.display()), e))?;
        tmp.persist(path)
            .map_err(|e| Error::io(format!("Failed to write {}", path.display()), e))?;
        Ok(())
    }
}
