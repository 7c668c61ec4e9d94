//! Package dependency metadata
//!
//! Represents the metadata JSON fetched from a package server.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::Checksums;

/// Package metadata fetched from the package server
///
/// This is the JSON structure returned when fetching a package's metadata URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyMetadata {
    /// Package name
    pub name: String,

    /// Full package URI
    pub package_uri: String,

    /// Package version
    pub version: String,

    /// URL to download the package ZIP
    pub package_zip_url: String,

    /// Checksums for the package ZIP
    pub package_zip_checksums: Checksums,

    /// Dependencies of this package, in declaration order
    #[serde(default)]
    pub dependencies: IndexMap<String, PackageDependency>,

    /// Source code URL scheme for documentation links
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code_url_scheme: Option<String>,

    /// Source code repository URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,

    /// Documentation URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,

    /// License identifier (e.g., "Apache-2.0")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    /// Package authors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,

    /// Issue tracker URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_tracker: Option<String>,

    /// Package description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A dependency reference in package metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDependency {
    /// The package URI of the dependency
    pub uri: String,

    /// Checksums of the dependency's metadata document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksums: Option<Checksums>,
}

impl DependencyMetadata {
    /// Parse metadata from JSON
    pub fn from_json(json: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(json)
    }

    /// Serialize metadata to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
