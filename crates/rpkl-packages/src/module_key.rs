//! Module keys and import resolution
//!
//! A [`ModuleKey`] identifies where a module came from. The origin decides how
//! relative imports resolve, where a triple-dot search stops, and how the
//! existence of a candidate is checked.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use percent_encoding::percent_decode_str;

use crate::error::{Error, Result};
use crate::packages::{PackageAssetUri, PackageResolver};
use crate::project::{ProjectDeps, ResolvedAsset};
use crate::security::SecurityManager;
use crate::uri::{self, Uri};

/// Ordered list of root directories searched for `modulepath:` URIs
#[derive(Debug, Clone, Default)]
pub struct ModulePath {
    roots: Vec<PathBuf>,
}

impl ModulePath {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Locate the path of a `modulepath:` URI in the first root containing it
    pub fn find(&self, uri_path: &str) -> Option<PathBuf> {
        let decoded = percent_decode_str(uri_path).decode_utf8().ok()?;
        let relative = decoded.trim_start_matches('/');
        if relative.is_empty() || relative.split('/').any(|s| s == "..") {
            return None;
        }
        self.roots
            .iter()
            .map(|root| root.join(relative))
            .find(|candidate| candidate.exists())
    }
}

/// Identity and origin of a module
#[derive(Clone)]
pub enum ModuleKey {
    /// `file:` module; ascends to the filesystem root
    File(Uri),
    /// `modulepath:` module; ascends to the module path roots
    ModulePath {
        uri: Uri,
        module_path: Arc<ModulePath>,
    },
    /// `http:` or `https:` module; no ascension
    Http(Uri),
    /// Module inside a package; ascends to the package root
    Package {
        asset: PackageAssetUri,
        resolver: Arc<dyn PackageResolver>,
    },
    /// Standard library module such as `pkl:base`; no ascension
    Builtin(Uri),
}

impl fmt::Debug for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ModuleKey::File(_) => "File",
            ModuleKey::ModulePath { .. } => "ModulePath",
            ModuleKey::Http(_) => "Http",
            ModuleKey::Package { .. } => "Package",
            ModuleKey::Builtin(_) => "Builtin",
        };
        f.debug_tuple(kind).field(&self.uri().to_string()).finish()
    }
}

impl ModuleKey {
    pub fn uri(&self) -> Uri {
        match self {
            ModuleKey::File(uri)
            | ModuleKey::Http(uri)
            | ModuleKey::Builtin(uri)
            | ModuleKey::ModulePath { uri, .. } => uri.clone(),
            ModuleKey::Package { asset, .. } => asset.to_uri(),
        }
    }

    /// Name of the module as inferred from its URI
    pub fn module_name(&self) -> String {
        uri::infer_module_name(&self.uri())
    }

    /// Resolve an import of `reference` from this module
    ///
    /// Handles triple-dot references (`...`, `.../path`) by searching upward
    /// from the enclosing directory. The result passes the security manager's
    /// resolve and import checks.
    pub fn resolve_import(&self, security: &dyn SecurityManager, reference: &str) -> Result<Uri> {
        let resolved = match parse_ascension(reference)? {
            Some(target) => self.resolve_ascension(security, reference, target)?,
            None => self.resolve_relative(reference)?,
        };
        security.check_resolve_module(&resolved)?;
        security.check_import_module(&self.uri(), &resolved)?;
        Ok(resolved)
    }

    fn resolve_relative(&self, reference: &str) -> Result<Uri> {
        let reference_uri = Uri::parse(reference)?;
        if reference_uri.is_absolute() {
            return Ok(reference_uri);
        }

        match self {
            ModuleKey::Package { asset, .. } => {
                if reference_uri.authority().is_some() {
                    return Err(Error::MalformedReference(format!(
                        "Cannot resolve `{}` inside package `{}`",
                        reference, asset.package
                    )));
                }
                let path = reference_uri.path();
                let target = if path.is_empty() {
                    asset.asset_path.clone()
                } else if path.starts_with('/') {
                    path.to_string()
                } else {
                    format!("{}{}", parent_dir(&asset.asset_path), path)
                };
                let resolved = asset.with_asset_path(&target)?.to_uri();
                Ok(resolved.with_query(reference_uri.query().map(str::to_string)))
            }
            _ => {
                let base = self.uri();
                let resolved = uri::resolve(&base, &reference_uri);
                if !resolved.is_absolute() {
                    return Err(Error::MalformedReference(format!(
                        "Cannot resolve relative reference `{}` from module `{}`",
                        reference, base
                    )));
                }
                Ok(resolved)
            }
        }
    }

    fn resolve_ascension(
        &self,
        security: &dyn SecurityManager,
        reference: &str,
        target: Option<&str>,
    ) -> Result<Uri> {
        let own_path = match self {
            ModuleKey::Http(uri) | ModuleKey::Builtin(uri) => {
                return Err(Error::AscensionNotSupported(uri.to_string()))
            }
            ModuleKey::File(uri) | ModuleKey::ModulePath { uri, .. } => {
                if uri.is_opaque() {
                    return Err(Error::AscensionNotSupported(uri.to_string()));
                }
                uri.path().to_string()
            }
            ModuleKey::Package { asset, .. } => asset.asset_path.clone(),
        };

        let file_name = own_path.rsplit('/').next().unwrap_or_default();
        let target = target.unwrap_or(file_name);
        if target.is_empty() {
            return Err(Error::MalformedReference(format!(
                "Cannot resolve `{}` from module `{}`, which has no file name",
                reference,
                self.uri()
            )));
        }

        let mut dir = parent_dir(&own_path).to_string();
        loop {
            let candidate_path = format!("{}{}", dir, target);
            if uri::remove_dot_segments(&candidate_path) != own_path {
                if let Some(candidate) = self.candidate(&candidate_path)? {
                    security.check_resolve_module(&candidate)?;
                    if self.exists(&candidate)? {
                        tracing::trace!("Resolved {} to {}", reference, candidate);
                        return Ok(candidate);
                    }
                }
            }
            if dir == "/" || dir.is_empty() {
                break;
            }
            dir = parent_dir(dir.trim_end_matches('/')).to_string();
        }

        Err(Error::ModuleNotFound(format!(
            "Cannot find module `{}` in any directory above `{}`",
            reference,
            self.uri()
        )))
    }

    /// Candidate URI for a path in this module's origin; `None` if it leaves
    /// the origin's root
    fn candidate(&self, path: &str) -> Result<Option<Uri>> {
        match self {
            ModuleKey::Package { asset, .. } => match asset.with_asset_path(path) {
                Ok(candidate) => Ok(Some(candidate.to_uri())),
                Err(Error::MalformedUri(_)) => Ok(None),
                Err(e) => Err(e),
            },
            _ => {
                let base = self.uri().with_fragment(None);
                Ok(Some(base.with_path(uri::remove_dot_segments(path))))
            }
        }
    }

    fn exists(&self, candidate: &Uri) -> Result<bool> {
        match self {
            ModuleKey::File(_) => Ok(candidate
                .to_path()?
                .is_some_and(|path| Path::new(&path).exists())),
            ModuleKey::ModulePath { module_path, .. } => {
                Ok(module_path.find(candidate.path()).is_some())
            }
            ModuleKey::Package { resolver, .. } => {
                let asset = PackageAssetUri::parse(&candidate.to_string())?;
                resolver.has_element(&asset, None)
            }
            ModuleKey::Http(_) | ModuleKey::Builtin(_) => Ok(false),
        }
    }
}

/// Directory part of a path, including the trailing slash
fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "",
    }
}

fn read_file(path: &Path, uri: &Uri) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::AssetNotFound(uri.to_string()))
        }
        Err(e) => Err(Error::io(format!("Failed to read {}", path.display()), e)),
    }
}

/// Split a triple-dot reference into its target
///
/// `Ok(None)` for ordinary references, `Ok(Some(None))` for a bare `...`,
/// `Ok(Some(Some(path)))` for `.../path`.
fn parse_ascension(reference: &str) -> Result<Option<Option<&str>>> {
    let Some(rest) = reference.strip_prefix("...") else {
        return Ok(None);
    };
    if rest.is_empty() {
        return Ok(Some(None));
    }
    match rest.strip_prefix('/') {
        Some(suffix) if !suffix.is_empty() && !suffix.ends_with('/') => Ok(Some(Some(suffix))),
        _ => Err(Error::MalformedReference(format!(
            "`{}` is not a valid triple-dot import. Expected `...` or `.../<path>`.",
            reference
        ))),
    }
}

/// Creates [`ModuleKey`]s from URIs
#[derive(Clone, Default)]
pub struct ModuleKeys {
    module_path: Option<Arc<ModulePath>>,
    package_resolver: Option<Arc<dyn PackageResolver>>,
    project: Option<(Arc<ProjectDeps>, PathBuf)>,
}

impl ModuleKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module_path(mut self, module_path: Arc<ModulePath>) -> Self {
        self.module_path = Some(module_path);
        self
    }

    pub fn with_package_resolver(mut self, resolver: Arc<dyn PackageResolver>) -> Self {
        self.package_resolver = Some(resolver);
        self
    }

    /// Resolve `projectpackage:` URIs through a project's dependency manifest
    pub fn with_project(mut self, deps: Arc<ProjectDeps>, project_dir: impl Into<PathBuf>) -> Self {
        self.project = Some((deps, project_dir.into()));
        self
    }

    /// Create the key for a module URI
    pub fn create(&self, uri: &Uri) -> Result<ModuleKey> {
        let scheme = uri.scheme().map(str::to_ascii_lowercase);
        match scheme.as_deref() {
            Some("file") => Ok(ModuleKey::File(uri.clone())),
            Some("http" | "https") => Ok(ModuleKey::Http(uri.clone())),
            Some("pkl") => Ok(ModuleKey::Builtin(uri.clone())),
            Some("modulepath") => {
                let module_path = self.module_path.clone().ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "Cannot load `{}` because no module path is configured",
                        uri
                    ))
                })?;
                Ok(ModuleKey::ModulePath {
                    uri: uri.clone(),
                    module_path,
                })
            }
            Some("package") => {
                let asset = PackageAssetUri::parse(&uri.to_string())?;
                Ok(ModuleKey::Package {
                    asset,
                    resolver: self.require_package_resolver(uri)?,
                })
            }
            Some("projectpackage") => {
                let (deps, project_dir) = self.project.as_ref().ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "Cannot load `{}` outside of a project",
                        uri
                    ))
                })?;
                let asset = PackageAssetUri::parse(&uri.to_string())?;
                match deps.resolve_asset(&asset, project_dir)? {
                    ResolvedAsset::Remote(asset) => Ok(ModuleKey::Package {
                        asset,
                        resolver: self.require_package_resolver(uri)?,
                    }),
                    ResolvedAsset::Local(path) => Ok(ModuleKey::File(Uri::from_path(&path)?)),
                }
            }
            _ => Err(Error::InvalidArgument(format!(
                "Unsupported module URI `{}`",
                uri
            ))),
        }
    }

    /// Read a resource such as a package asset or a local file
    ///
    /// The requested URI passes `check_resolve_resource` and the URI actually
    /// read passes `check_read_resource`. A package directory reads as its
    /// listing.
    pub fn read_resource(&self, security: &dyn SecurityManager, uri: &Uri) -> Result<Vec<u8>> {
        security.check_resolve_resource(uri)?;
        match self.create(uri)? {
            ModuleKey::Package { asset, resolver } => {
                security.check_read_resource(&asset.to_uri())?;
                resolver.get_bytes(&asset, true, None)
            }
            ModuleKey::File(file) => {
                security.check_read_resource(&file)?;
                let path = file.to_path()?.ok_or_else(|| {
                    Error::InvalidArgument(format!("Cannot read resource `{}`", file))
                })?;
                read_file(&path, &file)
            }
            ModuleKey::ModulePath { uri, module_path } => {
                security.check_read_resource(&uri)?;
                let path = module_path
                    .find(uri.path())
                    .ok_or_else(|| Error::AssetNotFound(uri.to_string()))?;
                read_file(&path, &uri)
            }
            other => Err(Error::InvalidArgument(format!(
                "Cannot read resource `{}`",
                other.uri()
            ))),
        }
    }

    fn require_package_resolver(&self, uri: &Uri) -> Result<Arc<dyn PackageResolver>> {
        self.package_resolver.clone().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "Cannot load `{}` because package loading is disabled",
                uri
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::security::SecurityManagers;

    #[test]
    fn test_parse_ascension() {
        assert_eq!(parse_ascension("foo.pkl").unwrap(), None);
        assert_eq!(parse_ascension("../foo.pkl").unwrap(), None);
        assert_eq!(parse_ascension("...").unwrap(), Some(None));
        assert_eq!(parse_ascension(".../foo.pkl").unwrap(), Some(Some("foo.pkl")));
        assert_eq!(
            parse_ascension(".../a/b/foo.pkl").unwrap(),
            Some(Some("a/b/foo.pkl"))
        );
        for bad in ["...x", "....", ".../", ".../foo/"] {
            assert!(
                matches!(parse_ascension(bad), Err(Error::MalformedReference(_))),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_relative_imports() {
        let security = SecurityManagers::standard();
        let key = ModuleKey::File(Uri::parse("file:///foo/bar/baz.pkl").unwrap());
        assert_eq!(
            key.resolve_import(security.as_ref(), "qux.pkl").unwrap().to_string(),
            "file:///foo/bar/qux.pkl"
        );
        assert_eq!(
            key.resolve_import(security.as_ref(), "../qux.pkl").unwrap().to_string(),
            "file:///foo/qux.pkl"
        );
        assert_eq!(
            key.resolve_import(security.as_ref(), "pkl:json").unwrap().to_string(),
            "pkl:json"
        );
        assert_eq!(key.module_name(), "baz");
    }

    #[test]
    fn test_relative_import_from_builtin_fails() {
        let key = ModuleKey::Builtin(Uri::parse("pkl:base").unwrap());
        let security = SecurityManagers::unrestricted();
        assert!(matches!(
            key.resolve_import(security.as_ref(), "foo.pkl"),
            Err(Error::MalformedReference(_))
        ));
    }

    #[test]
    fn test_ascension_not_supported() {
        let security = SecurityManagers::standard();
        let http = ModuleKey::Http(Uri::parse("https://example.com/foo/bar.pkl").unwrap());
        assert_eq!(
            http.resolve_import(security.as_ref(), ".../bar.pkl"),
            Err(Error::AscensionNotSupported(
                "https://example.com/foo/bar.pkl".to_string()
            ))
        );
        let builtin = ModuleKey::Builtin(Uri::parse("pkl:base").unwrap());
        assert!(matches!(
            builtin.resolve_import(security.as_ref(), "..."),
            Err(Error::AscensionNotSupported(_))
        ));
    }

    #[test]
    fn test_malformed_ascension_fails_before_probing() {
        let key = ModuleKey::Http(Uri::parse("https://example.com/foo/bar.pkl").unwrap());
        let security = SecurityManagers::standard();
        assert!(matches!(
            key.resolve_import(security.as_ref(), "...bar.pkl"),
            Err(Error::MalformedReference(_))
        ));
    }

    #[test]
    fn test_security_denies_import() {
        let key = ModuleKey::Http(Uri::parse("https://example.com/foo/bar.pkl").unwrap());
        let security = SecurityManagers::standard();
        assert!(matches!(
            key.resolve_import(security.as_ref(), "file:///etc/passwd"),
            Err(Error::Security(_))
        ));
        assert!(matches!(
            key.resolve_import(security.as_ref(), "ftp://example.com/x.pkl"),
            Err(Error::Security(_))
        ));
    }

    #[test]
    fn test_module_keys() {
        let keys = ModuleKeys::new();
        let file = keys.create(&Uri::parse("file:///foo.pkl").unwrap()).unwrap();
        assert!(matches!(file, ModuleKey::File(_)));
        assert!(matches!(
            keys.create(&Uri::parse("modulepath:/foo.pkl").unwrap()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            keys.create(&Uri::parse("package://localhost:0/birds@0.5.0#/Bird.pkl").unwrap()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            keys.create(&Uri::parse("ftp://foo/bar.pkl").unwrap()),
            Err(Error::InvalidArgument(_))
        ));
    }
}
