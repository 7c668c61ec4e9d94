//! Package URI parsing
//!
//! Handles `package://` and `projectpackage://` URIs.
//! Format: `package://authority/path@version[::sha256:<hex>][#/asset/path]`

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use semver::Version;

use crate::error::{Error, Result};
use crate::uri::{normalize_path, Uri};

use super::Checksums;

/// A package URI representing a versioned package
///
/// Format: `package://authority/path@version`
/// Example: `package://pkg.pkl-lang.org/pkl-pantry/pkl.toml@1.0.0`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageUri {
    /// The URI scheme (package or projectpackage)
    pub scheme: PackageScheme,
    /// The authority (host and optional port)
    pub authority: String,
    /// The package path (without version), always starting with `/`
    pub path: String,
    /// The package version
    pub version: Version,
    /// Optional checksum pin of the package metadata (appended with ::)
    pub checksums: Option<Checksums>,
}

/// Package URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageScheme {
    /// Standard package URI
    Package,
    /// Project-local package URI (resolved via PklProject.deps.json)
    ProjectPackage,
}

impl PackageScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageScheme::Package => "package",
            PackageScheme::ProjectPackage => "projectpackage",
        }
    }
}

impl fmt::Display for PackageScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PackageUri {
    /// Parse a package URI string
    ///
    /// Format: `package://authority/path@version[::sha256:<hex>]`
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = if let Some(rest) = uri.strip_prefix("package://") {
            (PackageScheme::Package, rest)
        } else if let Some(rest) = uri.strip_prefix("projectpackage://") {
            (PackageScheme::ProjectPackage, rest)
        } else {
            return Err(Error::malformed(format!(
                "Invalid package URI scheme: `{}`",
                uri
            )));
        };

        if rest.contains('#') {
            return Err(Error::malformed(format!(
                "Package URI `{}` must not have a fragment. Use a package asset URI to address a file inside the package.",
                uri
            )));
        }

        // IPv6 authorities contain `::`, so the pin is searched after the path
        let path_start = rest.find('/').unwrap_or(rest.len());
        let (main_part, checksums) = match rest[path_start..].find("::") {
            Some(idx) => {
                let idx = path_start + idx;
                (&rest[..idx], Some(Checksums::parse(&rest[idx + 2..])?))
            }
            None => (rest, None),
        };

        let slash_idx = main_part
            .find('/')
            .ok_or_else(|| Error::malformed(format!("Missing path in package URI `{}`", uri)))?;

        let authority = &main_part[..slash_idx];
        let path_with_version = &main_part[slash_idx..];

        let at_idx = path_with_version.rfind('@').ok_or_else(|| {
            Error::malformed(format!("Missing version in package URI `{}`", uri))
        })?;

        let path = &path_with_version[..at_idx];
        let version = &path_with_version[at_idx + 1..];

        if authority.is_empty() {
            return Err(Error::malformed(format!(
                "Empty authority in package URI `{}`",
                uri
            )));
        }

        if path.len() <= 1 {
            return Err(Error::malformed(format!(
                "Empty path in package URI `{}`",
                uri
            )));
        }

        if path[1..]
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(Error::malformed(format!(
                "Invalid path `{}` in package URI `{}`",
                path, uri
            )));
        }

        if version.is_empty() {
            return Err(Error::malformed(format!(
                "Missing version in package URI `{}`",
                uri
            )));
        }

        let version = Version::parse(version).map_err(|e| {
            Error::malformed(format!(
                "Invalid semantic version `{}` in package URI `{}`: {}",
                version, uri, e
            ))
        })?;

        Ok(Self {
            scheme,
            authority: authority.to_string(),
            path: path.to_string(),
            version,
            checksums,
        })
    }

    /// The host part of the authority
    pub fn host(&self) -> &str {
        match self.authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => &self.authority,
        }
    }

    /// The port part of the authority, if any
    pub fn port(&self) -> Option<u16> {
        let (_, port) = self.authority.rsplit_once(':')?;
        port.parse().ok()
    }

    /// The last path segment, e.g. `pkl.toml` for `/pkl-pantry/pkl.toml`
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Get the HTTPS URL for fetching package metadata
    ///
    /// Transforms `package://authority/path@version` to `https://authority/path@version`
    pub fn metadata_url(&self) -> String {
        format!("https://{}{}", self.authority, self.path_with_version())
    }

    /// Get the path with version suffix
    pub fn path_with_version(&self) -> String {
        format!("{}@{}", self.path, self.version)
    }

    /// This URI without a checksum pin
    pub fn base(&self) -> Self {
        Self {
            checksums: None,
            ..self.clone()
        }
    }

    /// Get the canonical form (major version only, for dependency grouping)
    pub fn canonical(&self) -> CanonicalPackageUri {
        CanonicalPackageUri {
            authority: self.authority.clone(),
            path: self.path.clone(),
            major_version: self.version.major,
        }
    }

    /// Convert to a projectpackage:// URI
    pub fn to_project_package(&self) -> Self {
        Self {
            scheme: PackageScheme::ProjectPackage,
            ..self.clone()
        }
    }

    /// Convert to a package:// URI
    pub fn to_package(&self) -> Self {
        Self {
            scheme: PackageScheme::Package,
            ..self.clone()
        }
    }

    /// Convert to a generic [`Uri`] (without checksums)
    pub fn to_uri(&self) -> Uri {
        Uri::from_parts(
            Some(self.scheme.as_str()),
            Some(&self.authority),
            self.path_with_version(),
            None,
        )
    }

    /// Get the cache directory for this package
    ///
    /// `<cache_dir>/package-1/<authority>/<path>@<version>`
    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        let mut dir = cache_dir
            .join("package-1")
            .join(encode_path_component(&self.authority));
        let mut segments = self.path[1..].split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                dir.push(encode_path_component(segment));
            } else {
                dir.push(encode_path_component(&format!(
                    "{}@{}",
                    segment, self.version
                )));
            }
        }
        dir
    }

    /// Get the path of the cached metadata document, stored beside [`cache_path`](Self::cache_path)
    pub fn metadata_cache_path(&self, cache_dir: &Path) -> PathBuf {
        let mut path = self.cache_path(cache_dir);
        let file_name = format!(
            "{}.json",
            encode_path_component(&format!("{}@{}", self.name(), self.version))
        );
        path.set_file_name(file_name);
        path
    }
}

impl fmt::Display for PackageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme,
            self.authority,
            self.path_with_version()
        )?;
        if let Some(ref checksums) = self.checksums {
            write!(f, "::{}", checksums)?;
        }
        Ok(())
    }
}

/// Canonical package URI (for dependency grouping)
///
/// Uses only major version for grouping multiple versions of the same package.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalPackageUri {
    pub authority: String,
    pub path: String,
    pub major_version: u64,
}

impl fmt::Display for CanonicalPackageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "package://{}{}@{}",
            self.authority, self.path, self.major_version
        )
    }
}

/// A package asset URI (package URI with asset path)
///
/// Format: `package://authority/path@version#/asset/path`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageAssetUri {
    /// The base package URI
    pub package: PackageUri,
    /// The normalized asset path within the package, starting with `/`
    pub asset_path: String,
}

impl PackageAssetUri {
    /// Parse a package asset URI
    ///
    /// Format: `package://authority/path@version#/asset/path.pkl`
    pub fn parse(uri: &str) -> Result<Self> {
        let (package_part, asset_path) = uri.split_once('#').ok_or_else(|| {
            Error::malformed(format!("Package asset URI `{}` is missing a fragment", uri))
        })?;

        let package = PackageUri::parse(package_part)?;
        Self::new(package, asset_path).map_err(|e| match e {
            Error::MalformedUri(msg) => Error::malformed(format!("{} (in `{}`)", msg, uri)),
            other => other,
        })
    }

    /// Create an asset URI, normalizing `.` and `..` segments in the asset path
    pub fn new(package: PackageUri, asset_path: &str) -> Result<Self> {
        if !asset_path.starts_with('/') {
            return Err(Error::malformed(format!(
                "Asset path `{}` must be absolute (start with `/`)",
                asset_path
            )));
        }
        let asset_path = normalize_path(asset_path).ok_or_else(|| {
            Error::malformed(format!(
                "Asset path `{}` navigates above the package root",
                asset_path
            ))
        })?;
        Ok(Self {
            package,
            asset_path,
        })
    }

    /// Return a copy pointing at another asset of the same package
    pub fn with_asset_path(&self, asset_path: &str) -> Result<Self> {
        Self::new(self.package.clone(), asset_path)
    }

    /// The decoded asset path without leading or trailing slashes (`""` is
    /// the package root)
    pub fn relative_path(&self) -> Cow<'_, str> {
        percent_decode_str(self.asset_path.trim_matches('/')).decode_utf8_lossy()
    }

    /// Convert to a generic [`Uri`] (without checksums)
    pub fn to_uri(&self) -> Uri {
        Uri::from_parts(
            Some(self.package.scheme.as_str()),
            Some(&self.package.authority),
            self.package.path_with_version(),
            Some(&self.asset_path),
        )
    }

    /// Check if this is a package asset URI (has fragment)
    pub fn is_package_asset_uri(uri: &str) -> bool {
        (uri.starts_with("package://") || uri.starts_with("projectpackage://")) && uri.contains('#')
    }
}

impl fmt::Display for PackageAssetUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.package, self.asset_path)
    }
}

/// Encode a path component for safe filesystem storage
fn encode_path_component(s: &str) -> String {
    if cfg!(windows) {
        s.replace(':', "(3a)")
    } else {
        s.to_string()
    }
}
