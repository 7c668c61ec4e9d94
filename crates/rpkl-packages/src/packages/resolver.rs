//! Package resolution and caching

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;

use crate::error::{Error, FetchError, Result};
use crate::security::SecurityManager;
use crate::uri::Uri;

use super::http::Transport;
use super::storage::{DiskStorage, ElementKind, MemoryStorage, PackageEntry, PackageStorage};
use super::{Checksums, DependencyMetadata, PackageAssetUri, PackageScheme, PackageUri};

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathElement {
    pub name: String,
    pub is_directory: bool,
}

impl PathElement {
    pub fn new(name: impl Into<String>, is_directory: bool) -> Self {
        Self {
            name: name.into(),
            is_directory,
        }
    }
}

/// Receives human-readable progress messages
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str);
}

/// Writes progress messages line by line to a [`Write`] implementation
pub struct WriterProgress<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterProgress<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> ProgressSink for WriterProgress<W> {
    fn report(&self, message: &str) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{}", message);
        }
    }
}

fn report(progress: Option<&dyn ProgressSink>, message: impl FnOnce() -> String) {
    if let Some(progress) = progress {
        progress.report(&message());
    }
}

/// Package resolver interface
pub trait PackageResolver: Send + Sync {
    /// Get the bytes of an asset within a package
    ///
    /// When the asset is a directory and `allow_directory_read` is set, the
    /// result is the sorted list of its children, one name per line.
    fn get_bytes(
        &self,
        asset: &PackageAssetUri,
        allow_directory_read: bool,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<Vec<u8>>;

    /// Get the asset as a string
    fn get_text(
        &self,
        asset: &PackageAssetUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<String> {
        let bytes = self.get_bytes(asset, false, progress)?;
        String::from_utf8(bytes)
            .map_err(|e| Error::io(format!("Failed to decode `{}` as UTF-8", asset), e))
    }

    /// List the immediate children of a directory within a package
    fn list_elements(
        &self,
        asset: &PackageAssetUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<HashSet<PathElement>>;

    /// Check if a file or directory exists within a package
    fn has_element(
        &self,
        asset: &PackageAssetUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<bool>;

    /// Fetch the metadata of a package together with the checksum of the
    /// metadata document, without downloading the archive
    fn get_dependency_metadata(
        &self,
        package: &PackageUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(DependencyMetadata, Checksums)>;

    /// Fetch, verify and materialize a package
    fn download_package(
        &self,
        package: &PackageUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<()>;
}

/// Per-key deduplication of in-flight work
///
/// The first caller for a key runs the initializer while concurrent callers
/// block on the same slot. Successful results stay memoized; a failed slot is
/// dropped once its waiters have observed the error.
struct SingleFlight<V> {
    slots: DashMap<String, Arc<OnceLock<Result<V>>>>,
}

impl<V: Clone> SingleFlight<V> {
    fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    fn get_or_try_init(&self, key: &str, init: impl FnOnce() -> Result<V>) -> Result<V> {
        // The map guard must be released before blocking on the slot.
        let slot = Arc::clone(&self.slots.entry(key.to_string()).or_default());

        let result = slot.get_or_init(init).clone();
        if result.is_err() {
            self.slots
                .remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
        }
        result
    }
}

/// Metadata document of a package as fetched
#[derive(Debug)]
struct FetchedMetadata {
    metadata: DependencyMetadata,
    checksums: Checksums,
}

/// Package resolver implementing the verify-then-materialize protocol over a
/// [`PackageStorage`]
pub struct CachingPackageResolver<S: PackageStorage> {
    storage: S,
    transport: Arc<dyn Transport>,
    security: Arc<dyn SecurityManager>,
    metadata: SingleFlight<Arc<FetchedMetadata>>,
    entries: SingleFlight<Arc<S::Entry>>,
}

/// Downloads packages and caches them in a directory shared across processes
pub type DiskCachedPackageResolver = CachingPackageResolver<DiskStorage>;

/// Downloads packages and keeps them in process memory
pub type InMemoryPackageResolver = CachingPackageResolver<MemoryStorage>;

impl CachingPackageResolver<DiskStorage> {
    pub fn new(
        cache_dir: impl AsRef<Path>,
        transport: Arc<dyn Transport>,
        security: Arc<dyn SecurityManager>,
    ) -> Result<Self> {
        let storage = DiskStorage::new(cache_dir.as_ref())?;
        Ok(Self::with_storage(storage, transport, security))
    }

    pub fn cache_dir(&self) -> &Path {
        self.storage.cache_dir()
    }
}

impl CachingPackageResolver<MemoryStorage> {
    pub fn new(transport: Arc<dyn Transport>, security: Arc<dyn SecurityManager>) -> Self {
        Self::with_storage(MemoryStorage, transport, security)
    }
}

impl<S: PackageStorage> CachingPackageResolver<S> {
    pub fn with_storage(
        storage: S,
        transport: Arc<dyn Transport>,
        security: Arc<dyn SecurityManager>,
    ) -> Self {
        Self {
            storage,
            transport,
            security,
            metadata: SingleFlight::new(),
            entries: SingleFlight::new(),
        }
    }

    fn check_package(&self, package: &PackageUri, uri: &Uri) -> Result<()> {
        if package.scheme == PackageScheme::ProjectPackage {
            return Err(Error::InvalidArgument(format!(
                "Cannot load `{}` directly. Project packages must be resolved through the project's dependencies.",
                uri
            )));
        }
        self.security.check_resolve_module(uri)
    }

    /// Metadata of a package, verifying the checksum pin of `package` if present
    fn metadata(
        &self,
        package: &PackageUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<Arc<FetchedMetadata>> {
        let base = package.base();
        let fetched = self
            .metadata
            .get_or_try_init(&base.to_string(), || self.fetch_metadata(&base, progress))?;

        if let Some(ref expected) = package.checksums {
            if !expected.matches(&fetched.checksums) {
                return Err(Error::PackageLoad(format!(
                    "Cannot download package `{}` because the computed checksum for package metadata does not match the expected checksum.\n\nComputed checksum: \"{}\"\nExpected checksum: \"{}\"\nAsset URL: \"{}\"",
                    base,
                    fetched.checksums.sha256,
                    expected.sha256,
                    base.metadata_url()
                )));
            }
        }
        Ok(fetched)
    }

    fn fetch_metadata(
        &self,
        package: &PackageUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<Arc<FetchedMetadata>> {
        let (bytes, fetched) = match self.storage.load_metadata(package)? {
            Some(bytes) => {
                tracing::trace!("Using cached metadata for {}", package);
                (bytes, false)
            }
            None => {
                report(progress, || format!("Downloading metadata for package `{}`", package));
                tracing::debug!("Fetching metadata for {}", package);
                let bytes = self
                    .transport
                    .fetch(&package.metadata_url())
                    .map_err(|e| download_error(package, e))?;
                (bytes, true)
            }
        };

        let metadata = DependencyMetadata::from_json(&bytes).map_err(|e| {
            Error::PackageLoad(format!(
                "Failed to parse metadata of package `{}` from `{}`: {}",
                package,
                package.metadata_url(),
                e
            ))
        })?;

        if fetched {
            self.storage.store_metadata(package, &bytes)?;
        }

        Ok(Arc::new(FetchedMetadata {
            checksums: Checksums::compute(&bytes),
            metadata,
        }))
    }

    fn entry(
        &self,
        package: &PackageUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<Arc<S::Entry>> {
        let base = package.base();
        let metadata = self.metadata(package, progress)?;
        self.entries.get_or_try_init(&base.to_string(), || {
            if let Some(entry) = self.storage.load_entry(&base)? {
                tracing::trace!("Using cached package {}", base);
                return Ok(Arc::new(entry));
            }
            self.fetch_archive(&base, &metadata.metadata, progress)
                .map(Arc::new)
        })
    }

    fn fetch_archive(
        &self,
        package: &PackageUri,
        metadata: &DependencyMetadata,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<S::Entry> {
        let zip_url = &metadata.package_zip_url;
        let is_https = Uri::parse(zip_url)
            .ok()
            .and_then(|uri| uri.scheme().map(|s| s.eq_ignore_ascii_case("https")))
            .unwrap_or(false);
        if !is_https {
            return Err(Error::PackageLoad(format!(
                "Expected the zip asset for package `{}` to be an HTTPS URI, but got `{}`.",
                package, zip_url
            )));
        }

        report(progress, || format!("Downloading package `{}`", package));
        tracing::debug!("Fetching archive for {} from {}", package, zip_url);
        let bytes = self
            .transport
            .fetch(zip_url)
            .map_err(|e| download_error(package, e))?;

        let computed = Checksums::compute(&bytes);
        let expected = &metadata.package_zip_checksums;
        if !computed.matches(expected) {
            return Err(Error::PackageLoad(format!(
                "Cannot download package `{}` because the computed checksum for package zip does not match the expected checksum.\n\nComputed checksum: \"{}\"\nExpected checksum: \"{}\"\nAsset URL: \"{}\"",
                package, computed.sha256, expected.sha256, zip_url
            )));
        }

        let entry = self.storage.materialize(package, &bytes)?;
        tracing::info!("Cached package {}", package);
        Ok(entry)
    }

    /// Entry and element kind of an asset, after the security check
    fn locate(
        &self,
        asset: &PackageAssetUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(Arc<S::Entry>, Option<ElementKind>)> {
        self.check_package(&asset.package, &asset.to_uri())?;
        let entry = self.entry(&asset.package, progress)?;
        let kind = entry.element_kind(&asset.relative_path())?;
        Ok((entry, kind))
    }
}

fn download_error(package: &PackageUri, error: FetchError) -> Error {
    Error::PackageLoad(format!("Cannot download package `{}`. {}", package, error))
}

impl<S: PackageStorage> PackageResolver for CachingPackageResolver<S> {
    fn get_bytes(
        &self,
        asset: &PackageAssetUri,
        allow_directory_read: bool,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<Vec<u8>> {
        let (entry, kind) = self.locate(asset, progress)?;
        let path = asset.relative_path();
        match kind {
            None => Err(Error::AssetNotFound(asset.to_string())),
            Some(ElementKind::File) => entry.read_file(&path),
            Some(ElementKind::Directory) if !allow_directory_read => {
                Err(Error::IsADirectory(asset.to_string()))
            }
            Some(ElementKind::Directory) => {
                let mut names: Vec<String> = entry
                    .list_children(&path)?
                    .into_iter()
                    .map(|element| element.name)
                    .collect();
                names.sort();
                let mut listing = String::new();
                for name in names {
                    listing.push_str(&name);
                    listing.push('\n');
                }
                Ok(listing.into_bytes())
            }
        }
    }

    fn list_elements(
        &self,
        asset: &PackageAssetUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<HashSet<PathElement>> {
        let (entry, kind) = self.locate(asset, progress)?;
        match kind {
            None => Err(Error::AssetNotFound(asset.to_string())),
            Some(ElementKind::File) => Err(Error::NotADirectory(asset.to_string())),
            Some(ElementKind::Directory) => Ok(entry
                .list_children(&asset.relative_path())?
                .into_iter()
                .collect()),
        }
    }

    fn has_element(
        &self,
        asset: &PackageAssetUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<bool> {
        let (_, kind) = self.locate(asset, progress)?;
        Ok(kind.is_some())
    }

    fn get_dependency_metadata(
        &self,
        package: &PackageUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(DependencyMetadata, Checksums)> {
        self.check_package(package, &package.to_uri())?;
        let fetched = self.metadata(package, progress)?;
        Ok((fetched.metadata.clone(), fetched.checksums.clone()))
    }

    fn download_package(
        &self,
        package: &PackageUri,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<()> {
        self.check_package(package, &package.to_uri())?;
        self.entry(package, progress).map(|_| ())
    }
}
