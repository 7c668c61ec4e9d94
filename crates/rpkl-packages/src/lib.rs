//! PKL package resolution
//!
//! This crate resolves, fetches, verifies and caches PKL packages, resolves
//! module imports (including triple-dot imports), and computes the
//! `PklProject.deps.json` manifest of a project.

pub mod error;
pub mod module_key;
pub mod packages;
pub mod project;
pub mod security;
pub mod settings;
pub mod uri;

pub use error::{Error, FetchError, Result};
pub use module_key::{ModuleKey, ModuleKeys, ModulePath};
pub use packages::{
    Checksums, DependencyMetadata, DiskCachedPackageResolver, HttpTransport,
    InMemoryPackageResolver, PackageAssetUri, PackageResolver, PackageUri, PathElement,
    ProgressSink, Transport,
};
pub use project::{
    JsonProjectLoader, Project, ProjectDependenciesResolver, ProjectDeps, ProjectLoader,
};
pub use security::{SecurityManager, SecurityManagers, StandardSecurityManager};
pub use settings::PackageSettings;
pub use uri::Uri;
