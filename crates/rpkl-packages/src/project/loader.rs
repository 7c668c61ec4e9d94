//! Project descriptors
//!
//! A project directory contains a `PklProject.json` declaring the project's
//! own package (if it is published) and its dependencies:
//!
//! ```json
//! {
//!   "package": {
//!     "name": "project2",
//!     "baseUri": "package://localhost:12110/project2",
//!     "version": "1.0.0"
//!   },
//!   "dependencies": {
//!     "birds": { "uri": "package://localhost:12110/birds@0.5.0" },
//!     "project3": { "path": "../project3" }
//!   }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::packages::{Checksums, PackageUri};

/// File name of a project descriptor
pub const PROJECT_FILE_NAME: &str = "PklProject.json";

/// A loaded project
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    /// Absolute, canonical project directory
    pub project_dir: PathBuf,
    /// The package this project publishes, if any
    pub package: Option<PackageDeclaration>,
    /// Declared dependencies in declaration order
    pub dependencies: IndexMap<String, Dependency>,
}

/// Package published by a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageDeclaration {
    pub name: String,
    /// Package URI without version, e.g. `package://example.com/foo`
    pub base_uri: String,
    pub version: String,
}

impl PackageDeclaration {
    /// The versioned package URI
    pub fn package_uri(&self) -> Result<PackageUri> {
        PackageUri::parse(&format!("{}@{}", self.base_uri, self.version)).map_err(|e| {
            Error::InvalidProject(format!(
                "Package `{}` declares an invalid base URI or version: {}",
                self.name, e
            ))
        })
    }
}

/// A declared dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// Remote package, optionally pinned to a metadata checksum
    Remote(PackageUri),
    /// Another project on disk
    Local { path: PathBuf },
}

/// Loads projects from directories
pub trait ProjectLoader {
    fn load(&self, project_dir: &Path) -> Result<Project>;
}

/// Loads `PklProject.json` descriptors
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonProjectLoader;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectFile {
    #[serde(default)]
    package: Option<PackageDeclaration>,
    #[serde(default)]
    dependencies: IndexMap<String, DependencyDeclaration>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyDeclaration {
    Remote {
        uri: String,
        #[serde(default)]
        checksums: Option<Checksums>,
    },
    Local {
        path: String,
    },
}

impl Project {
    /// Load a project with the default loader
    ///
    /// `path` may be the project directory or its descriptor file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        JsonProjectLoader.load(path)
    }

    /// Parse a descriptor for a project living in `project_dir`
    pub fn from_json(json: &str, project_dir: PathBuf) -> Result<Self> {
        let file: ProjectFile = serde_json::from_str(json).map_err(|e| {
            Error::InvalidProject(format!(
                "Failed to parse {}: {}",
                project_dir.join(PROJECT_FILE_NAME).display(),
                e
            ))
        })?;

        let mut dependencies = IndexMap::new();
        for (name, declaration) in file.dependencies {
            let dependency = match declaration {
                DependencyDeclaration::Remote { uri, checksums } => {
                    let mut package = PackageUri::parse(&uri)?;
                    if checksums.is_some() {
                        package.checksums = checksums;
                    }
                    Dependency::Remote(package)
                }
                DependencyDeclaration::Local { path } => Dependency::Local {
                    path: project_dir.join(path),
                },
            };
            dependencies.insert(name, dependency);
        }

        Ok(Self {
            project_dir,
            package: file.package,
            dependencies,
        })
    }
}

impl ProjectLoader for JsonProjectLoader {
    fn load(&self, path: &Path) -> Result<Project> {
        let path = if path.file_name().is_some_and(|name| name == PROJECT_FILE_NAME) {
            path.parent().unwrap_or(path)
        } else {
            path
        };
        let project_dir = fs::canonicalize(path).map_err(|e| {
            Error::InvalidProject(format!(
                "Cannot load project at {}: {}",
                path.display(),
                e
            ))
        })?;

        let descriptor = project_dir.join(PROJECT_FILE_NAME);
        let json = fs::read_to_string(&descriptor)
            .map_err(|e| Error::io(format!("Failed to read {}", descriptor.display()), e))?;
        tracing::debug!("Loaded project {}", project_dir.display());
        Project::from_json(&json, project_dir)
    }
}
