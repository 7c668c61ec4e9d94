//! Projects and their dependency manifests

mod deps;
mod loader;
mod resolver;

pub use deps::{ProjectDeps, ResolvedAsset, ResolvedDependency, DEPS_FILE_NAME, SCHEMA_VERSION};
pub use loader::{
    Dependency, JsonProjectLoader, PackageDeclaration, Project, ProjectLoader, PROJECT_FILE_NAME,
};
pub use resolver::ProjectDependenciesResolver;
