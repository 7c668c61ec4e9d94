//! Storage strategies for verified packages
//!
//! A storage strategy decides where a package lives once its archive has been
//! verified. The fetch and verification protocol itself lives in
//! [`CachingPackageResolver`](super::CachingPackageResolver).

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::uri::normalize_path;

use super::{PackageUri, PathElement};

/// Kind of an element inside a package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    File,
    Directory,
}

/// A verified, materialized package
///
/// Paths are relative to the package root, without leading or trailing
/// slashes; `""` names the root directory.
pub trait PackageEntry: Send + Sync {
    fn element_kind(&self, path: &str) -> Result<Option<ElementKind>>;

    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    fn list_children(&self, path: &str) -> Result<Vec<PathElement>>;
}

/// Where verified packages are kept
pub trait PackageStorage: Send + Sync {
    type Entry: PackageEntry + 'static;

    /// A previously stored metadata document, if any
    fn load_metadata(&self, package: &PackageUri) -> Result<Option<Vec<u8>>>;

    fn store_metadata(&self, package: &PackageUri, metadata: &[u8]) -> Result<()>;

    /// A previously materialized package, if any
    fn load_entry(&self, package: &PackageUri) -> Result<Option<Self::Entry>>;

    /// Materialize a verified archive
    fn materialize(&self, package: &PackageUri, archive: &[u8]) -> Result<Self::Entry>;
}

fn open_archive<'a>(package: &PackageUri, archive: &'a [u8]) -> Result<ZipArchive<Cursor<&'a [u8]>>> {
    ZipArchive::new(Cursor::new(archive)).map_err(|e| {
        Error::PackageLoad(format!(
            "Failed to open the zip archive of package `{}`: {}",
            package.base(),
            e
        ))
    })
}

/// Normalize an archive entry name, rejecting entries outside the package root
fn entry_path(package: &PackageUri, name: &str) -> Result<String> {
    let normalized = normalize_path(&format!("/{}", name.replace('\\', "/")))
        .ok_or_else(|| {
            Error::PackageLoad(format!(
                "Zip archive of package `{}` contains entry `{}` outside of the package root",
                package.base(),
                name
            ))
        })?;
    Ok(normalized.trim_matches('/').to_string())
}

fn archive_error(package: &PackageUri, e: impl std::fmt::Display) -> Error {
    Error::PackageLoad(format!(
        "Failed to read the zip archive of package `{}`: {}",
        package.base(),
        e
    ))
}

// =============================================================================
// Disk
// =============================================================================

/// Stores packages under `<cache_dir>/package-1`, shared across processes
pub struct DiskStorage {
    cache_dir: PathBuf,
}

impl DiskStorage {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|e| {
            Error::io(
                format!("Failed to create cache directory {}", cache_dir.display()),
                e,
            )
        })?;
        Ok(Self { cache_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Staging area; lives inside the cache root so renames stay on one filesystem
    fn staging_dir(&self) -> Result<PathBuf> {
        let tmp = self.cache_dir.join("tmp");
        fs::create_dir_all(&tmp).map_err(|e| {
            Error::io(
                format!("Failed to create staging directory {}", tmp.display()),
                e,
            )
        })?;
        Ok(tmp)
    }

    fn extract(&self, package: &PackageUri, archive: &[u8], dest: &Path) -> Result<()> {
        let mut zip = open_archive(package, archive)?;
        for i in 0..zip.len() {
            let mut file = zip.by_index(i).map_err(|e| archive_error(package, e))?;
            let relative = entry_path(package, file.name())?;
            if relative.is_empty() {
                continue;
            }
            let target = dest.join(&relative);
            if file.is_dir() {
                fs::create_dir_all(&target)
                    .map_err(|e| Error::io(format!("Failed to create {}", target.display()), e))?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io(format!("Failed to create {}", parent.display()), e))?;
            }
            let mut out = File::create(&target)
                .map_err(|e| Error::io(format!("Failed to create {}", target.display()), e))?;
            io::copy(&mut file, &mut out).map_err(|e| archive_error(package, e))?;
        }
        Ok(())
    }
}

impl PackageStorage for DiskStorage {
    type Entry = DiskEntry;

    fn load_metadata(&self, package: &PackageUri) -> Result<Option<Vec<u8>>> {
        let path = package.metadata_cache_path(&self.cache_dir);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("Failed to read {}", path.display()), e)),
        }
    }

    fn store_metadata(&self, package: &PackageUri, metadata: &[u8]) -> Result<()> {
        let path = package.metadata_cache_path(&self.cache_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("Failed to create {}", parent.display()), e))?;
        }
        let mut tmp = tempfile::NamedTempFile::new_in(self.staging_dir()?)
            .map_err(|e| Error::io("Failed to create temp file", e))?;
        tmp.write_all(metadata)
            .map_err(|e| Error::io("Failed to write package metadata", e))?;
        tmp.persist(&path)
            .map_err(|e| Error::io(format!("Failed to move metadata to {}", path.display()), e))?;
        Ok(())
    }

    fn load_entry(&self, package: &PackageUri) -> Result<Option<DiskEntry>> {
        let root = package.cache_path(&self.cache_dir);
        if root.is_dir() {
            Ok(Some(DiskEntry { root }))
        } else {
            Ok(None)
        }
    }

    fn materialize(&self, package: &PackageUri, archive: &[u8]) -> Result<DiskEntry> {
        let root = package.cache_path(&self.cache_dir);
        let staging = tempfile::Builder::new()
            .prefix("package-")
            .tempdir_in(self.staging_dir()?)
            .map_err(|e| Error::io("Failed to create staging directory", e))?;

        self.extract(package, archive, staging.path())?;

        if let Some(parent) = root.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("Failed to create {}", parent.display()), e))?;
        }

        // A failed rename onto an existing entry means another writer won.
        if let Err(e) = fs::rename(staging.path(), &root) {
            if !root.is_dir() {
                return Err(Error::io(
                    format!("Failed to move package into {}", root.display()),
                    e,
                ));
            }
            tracing::debug!("{} was populated concurrently", root.display());
        }

        Ok(DiskEntry { root })
    }
}

/// A package extracted on disk
#[derive(Debug, Clone)]
pub struct DiskEntry {
    root: PathBuf,
}

impl DiskEntry {
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

impl PackageEntry for DiskEntry {
    fn element_kind(&self, path: &str) -> Result<Option<ElementKind>> {
        let target = self.resolve(path);
        match fs::metadata(&target) {
            Ok(meta) if meta.is_dir() => Ok(Some(ElementKind::Directory)),
            Ok(_) => Ok(Some(ElementKind::File)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("Failed to stat {}", target.display()), e)),
        }
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path);
        let mut bytes = Vec::new();
        File::open(&target)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| Error::io(format!("Failed to read {}", target.display()), e))?;
        Ok(bytes)
    }

    fn list_children(&self, path: &str) -> Result<Vec<PathElement>> {
        let target = self.resolve(path);
        let entries = fs::read_dir(&target)
            .map_err(|e| Error::io(format!("Failed to list {}", target.display()), e))?;
        let mut elements = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::io(format!("Failed to list {}", target.display()), e))?;
            let is_directory = entry
                .file_type()
                .map_err(|e| Error::io(format!("Failed to stat {}", entry.path().display()), e))?
                .is_dir();
            match entry.file_name().into_string() {
                Ok(name) => elements.push(PathElement::new(name, is_directory)),
                Err(name) => tracing::warn!("Skipping non UTF-8 file name {:?}", name),
            }
        }
        Ok(elements)
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Keeps verified packages in process memory only
///
/// Nothing is persisted here; the resolver's memo table holds the entries.
#[derive(Debug, Default)]
pub struct MemoryStorage;

impl PackageStorage for MemoryStorage {
    type Entry = MemoryEntry;

    fn load_metadata(&self, _package: &PackageUri) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn store_metadata(&self, _package: &PackageUri, _metadata: &[u8]) -> Result<()> {
        Ok(())
    }

    fn load_entry(&self, _package: &PackageUri) -> Result<Option<MemoryEntry>> {
        Ok(None)
    }

    fn materialize(&self, package: &PackageUri, archive: &[u8]) -> Result<MemoryEntry> {
        let mut zip = open_archive(package, archive)?;
        let mut entry = MemoryEntry::default();
        entry.directories.insert(String::new());

        for i in 0..zip.len() {
            let mut file = zip.by_index(i).map_err(|e| archive_error(package, e))?;
            let relative = entry_path(package, file.name())?;
            if relative.is_empty() {
                continue;
            }
            if file.is_dir() {
                entry.add_directory(&relative);
                continue;
            }
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)
                .map_err(|e| archive_error(package, e))?;
            if let Some((parent, _)) = relative.rsplit_once('/') {
                entry.add_directory(parent);
            }
            entry.files.insert(relative, contents);
        }

        Ok(entry)
    }
}

/// A package held in memory
#[derive(Debug, Default)]
pub struct MemoryEntry {
    files: BTreeMap<String, Vec<u8>>,
    directories: BTreeSet<String>,
}

impl MemoryEntry {
    fn add_directory(&mut self, path: &str) {
        let mut current = path;
        loop {
            if !self.directories.insert(current.to_string()) {
                break;
            }
            match current.rsplit_once('/') {
                Some((parent, _)) => current = parent,
                None => break,
            }
        }
    }
}

impl PackageEntry for MemoryEntry {
    fn element_kind(&self, path: &str) -> Result<Option<ElementKind>> {
        if self.files.contains_key(path) {
            Ok(Some(ElementKind::File))
        } else if self.directories.contains(path) {
            Ok(Some(ElementKind::Directory))
        } else {
            Ok(None)
        }
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::AssetNotFound(path.to_string()))
    }

    fn list_children(&self, path: &str) -> Result<Vec<PathElement>> {
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let child = |key: &str| -> Option<String> {
            let rest = key.strip_prefix(prefix.as_str())?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };

        let directories = self
            .directories
            .iter()
            .filter_map(|d| child(d))
            .map(|name| PathElement::new(name, true));
        let files = self
            .files
            .keys()
            .filter_map(|f| child(f))
            .map(|name| PathElement::new(name, false));
        Ok(directories.chain(files).collect())
    }
}
