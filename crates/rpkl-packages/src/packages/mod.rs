//! Package management for PKL
//!
//! This module handles remote package resolution, downloading, verification
//! and caching. Supports `package://` and `projectpackage://` URI schemes.

mod checksums;
mod dependency;
mod http;
mod resolver;
mod storage;
mod uri;

pub use checksums::Checksums;
pub use dependency::{DependencyMetadata, PackageDependency};
pub use http::{HttpTransport, HttpTransportBuilder, Transport, DEFAULT_TIMEOUT_SECS};
pub use resolver::{
    CachingPackageResolver, DiskCachedPackageResolver, InMemoryPackageResolver,
    PackageResolver, PathElement, ProgressSink, WriterProgress,
};
pub use storage::{
    DiskEntry, DiskStorage, ElementKind, MemoryEntry, MemoryStorage, PackageEntry,
    PackageStorage,
};
pub use uri::{CanonicalPackageUri, PackageAssetUri, PackageScheme, PackageUri};
