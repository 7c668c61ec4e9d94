//! Project dependency resolution
//!
//! Walks a project's declared dependencies (remote packages and local
//! projects), picks one version per major-version key and produces the
//! manifest written to `PklProject.deps.json`.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use percent_encoding::percent_decode_str;

use crate::error::{Error, Result};
use crate::packages::{CanonicalPackageUri, Checksums, PackageResolver, PackageUri};
use crate::uri::{self, Uri};

use super::{Dependency, Project, ProjectDeps, ProjectLoader, ResolvedDependency};

/// A dependency chosen for a key during resolution
#[derive(Debug)]
enum Resolved {
    Remote {
        package: PackageUri,
        checksums: Checksums,
    },
    Local {
        package: PackageUri,
        project_dir: PathBuf,
    },
}

/// Resolves the transitive dependencies of a project
pub struct ProjectDependenciesResolver<'a, W: Write> {
    project: &'a Project,
    loader: &'a dyn ProjectLoader,
    package_resolver: &'a dyn PackageResolver,
    log: W,
    resolved: IndexMap<CanonicalPackageUri, Resolved>,
    visited: HashSet<PathBuf>,
}

impl<'a, W: Write> ProjectDependenciesResolver<'a, W> {
    pub fn new(
        project: &'a Project,
        loader: &'a dyn ProjectLoader,
        package_resolver: &'a dyn PackageResolver,
        log: W,
    ) -> Self {
        Self {
            project,
            loader,
            package_resolver,
            log,
            resolved: IndexMap::new(),
            visited: HashSet::new(),
        }
    }

    /// Resolve all dependencies into a fresh manifest
    pub fn resolve(mut self) -> Result<ProjectDeps> {
        let project = self.project;
        self.visited.insert(project.project_dir.clone());
        self.resolve_dependencies(project)?;

        let root_uri = Uri::from_path(&project.project_dir)?.ensure_path_ends_with_slash();
        let mut deps = ProjectDeps::default();
        for (key, resolved) in &self.resolved {
            let dependency = match resolved {
                Resolved::Remote { package, checksums } => ResolvedDependency::Remote {
                    uri: package.to_project_package().to_string(),
                    checksums: checksums.clone(),
                },
                Resolved::Local {
                    package,
                    project_dir,
                } => ResolvedDependency::Local {
                    uri: package.to_project_package().to_string(),
                    path: relative_path(&root_uri, project_dir)?,
                },
            };
            deps.resolved_dependencies.insert(key.to_string(), dependency);
        }

        tracing::info!(
            "Resolved {} dependencies of {}",
            deps.resolved_dependencies.len(),
            project.project_dir.display()
        );
        Ok(deps)
    }

    fn resolve_dependencies(&mut self, project: &Project) -> Result<()> {
        for dependency in project.dependencies.values() {
            match dependency {
                Dependency::Remote(package) => self.resolve_remote(package)?,
                Dependency::Local { path } => self.resolve_local(path)?,
            }
        }
        Ok(())
    }

    fn resolve_remote(&mut self, declared: &PackageUri) -> Result<()> {
        let key = declared.canonical();
        match self.resolved.get(&key) {
            Some(Resolved::Local { .. }) => return Ok(()),
            Some(Resolved::Remote { package, checksums }) if package.version >= declared.version => {
                if package.version == declared.version {
                    verify_pin(declared, checksums)?;
                }
                return Ok(());
            }
            _ => {}
        }

        let package = declared.base();
        self.log_line(&format!("Resolving {}", package))?;
        let (metadata, checksums) = self.package_resolver.get_dependency_metadata(&package, None)?;
        verify_pin(declared, &checksums)?;

        tracing::debug!("Resolved {} to {}", key, package);
        self.resolved
            .insert(key, Resolved::Remote { package, checksums });

        for dependency in metadata.dependencies.values() {
            let mut transitive = PackageUri::parse(&dependency.uri)?;
            if transitive.checksums.is_none() {
                transitive.checksums = dependency.checksums.clone();
            }
            self.resolve_remote(&transitive)?;
        }
        Ok(())
    }

    fn resolve_local(&mut self, path: &Path) -> Result<()> {
        let project = self.loader.load(path)?;
        let declaration = project.package.as_ref().ok_or_else(|| {
            Error::InvalidProject(format!(
                "Local dependency at {} does not declare a package",
                project.project_dir.display()
            ))
        })?;
        let package = declaration.package_uri()?;
        let key = package.canonical();

        if let Some(Resolved::Local { project_dir, .. }) = self.resolved.get(&key) {
            if *project_dir != project.project_dir {
                return Err(Error::Resolution(format!(
                    "Conflicting local dependencies for `{}`: {} and {}",
                    key,
                    project_dir.display(),
                    project.project_dir.display()
                )));
            }
        }
        if !self.visited.insert(project.project_dir.clone()) {
            return Ok(());
        }

        self.log_line(&format!("Resolving local project {}", project.project_dir.display()))?;
        self.resolved.insert(
            key,
            Resolved::Local {
                package,
                project_dir: project.project_dir.clone(),
            },
        );
        self.resolve_dependencies(&project)
    }

    fn log_line(&mut self, message: &str) -> Result<()> {
        writeln!(self.log, "{}", message).map_err(|e| Error::io("Failed to write progress", e))
    }
}

fn verify_pin(declared: &PackageUri, computed: &Checksums) -> Result<()> {
    match declared.checksums {
        Some(ref expected) if !expected.matches(computed) => Err(Error::Resolution(format!(
            "Computed checksum did not match declared checksum for dependency `{}`.\n\nComputed: \"{}\"\nDeclared: \"{}\"",
            declared.base(),
            computed.sha256,
            expected.sha256
        ))),
        _ => Ok(()),
    }
}

/// Path of `project_dir` relative to the root project directory
fn relative_path(root_uri: &Uri, project_dir: &Path) -> Result<String> {
    let dir_uri = Uri::from_path(project_dir)?.ensure_path_ends_with_slash();
    let relative = uri::relativize(&dir_uri, root_uri);
    let decoded = percent_decode_str(relative.path())
        .decode_utf8()
        .map_err(|e| Error::malformed(format!("Invalid path `{}`: {}", relative, e)))?;
    let trimmed = decoded.trim_end_matches('/');
    Ok(if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn root() -> Uri {
        Uri::from_path(Path::new("/work/project2"))
            .unwrap()
            .ensure_path_ends_with_slash()
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(
            relative_path(&root(), Path::new("/work/project3")).unwrap(),
            "../project3"
        );
        assert_eq!(
            relative_path(&root(), Path::new("/work/project2/libs/a")).unwrap(),
            "libs/a"
        );
        assert_eq!(
            relative_path(&root(), Path::new("/other/with space")).unwrap(),
            "../../other/with space"
        );
        assert_eq!(relative_path(&root(), Path::new("/work/project2")).unwrap(), ".");
    }

    #[test]
    fn test_verify_pin_message() {
        let declared = PackageUri::parse(
            "package://localhost:12110/birds@0.5.0::sha256:intentionally bogus value",
        )
        .unwrap();
        let err = verify_pin(&declared, &Checksums::new("3f19ab")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Computed checksum did not match declared checksum for dependency `package://localhost:12110/birds@0.5.0`.\n\nComputed: \"3f19ab\"\nDeclared: \"intentionally bogus value\""
        );
        assert!(verify_pin(&declared.base(), &Checksums::new("3f19ab")).is_ok());
    }
}
