//! In-process package server used by the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rpkl_packages::error::FetchError;
use rpkl_packages::{Checksums, Transport};
use serde_json::json;
use zip::write::SimpleFileOptions;

pub const HOST: &str = "localhost:0";

pub const BIRD_PKL: &str = r#"open module birds.Bird

import "@fruities/Fruit.pkl"

name: String

favoriteFruit: Fruit
"#;

pub const SWALLOW_PKL: &str = r#"amends "../Bird.pkl"

name = "Swallow"
"#;

/// Serves package metadata and archives from memory, counting every fetch
pub struct FakePackageServer {
    responses: HashMap<String, Vec<u8>>,
    checksums: HashMap<String, String>,
    fetches: Mutex<Vec<String>>,
    offline: AtomicBool,
    delay_ms: AtomicU64,
}

pub fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        if let Some(dir) = name.strip_suffix('/') {
            writer.add_directory(dir, SimpleFileOptions::default()).unwrap();
        } else {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

impl FakePackageServer {
    /// A server with the standard test packages
    ///
    /// * `birds@0.5.0`, depending on `fruit@1.0.5`
    /// * `fruit@1.0.5` and `fruit@1.1.0`
    /// * `spaced@1.0.0`, with an asset whose name needs percent-encoding
    /// * `badChecksum@1.0.0`, whose archive does not match its metadata
    /// * `badPackageZipUrl@1.0.0`, whose archive is not served over HTTPS
    pub fn new() -> Self {
        let mut server = Self {
            responses: HashMap::new(),
            checksums: HashMap::new(),
            fetches: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        };

        let fruit = |version: &str| {
            vec![(
                "Fruit.pkl".to_string(),
                format!("module fruit.Fruit\n\n// {}\nname: String\n", version),
            )]
        };
        server.add_package("fruit", "1.0.5", &fruit("1.0.5"), &[], None, None);
        server.add_package("fruit", "1.1.0", &fruit("1.1.0"), &[], None, None);

        let birds = [
            ("Bird.pkl", BIRD_PKL),
            ("allFruit.pkl", "import* \"@fruities/*.pkl\" as fruits\n"),
            ("catalog.pkl", "import* \"catalog/*.pkl\" as catalog\n"),
            ("catalog/Swallow.pkl", SWALLOW_PKL),
            ("catalog/Ostritch.pkl", "amends \"../Bird.pkl\"\n\nname = \"Ostritch\"\n"),
            ("some/dir/Bird.pkl", "amends \".../Bird.pkl\"\n\nname = \"Bird\"\n"),
        ]
        .map(|(name, contents)| (name.to_string(), contents.to_string()));
        server.add_package("birds", "0.5.0", &birds, &[("fruities", "fruit", "1.0.5")], None, None);

        let spaced = [(
            "catalog/Great Egret.pkl".to_string(),
            "amends \"../Bird.pkl\"\n\nname = \"Great Egret\"\n".to_string(),
        )];
        server.add_package("spaced", "1.0.0", &spaced, &[], None, None);

        let bug = [("Bug.pkl".to_string(), "name: String\n".to_string())];
        server.add_package(
            "badChecksum",
            "1.0.0",
            &bug,
            &[],
            None,
            Some("intentionally bogus checksum"),
        );
        server.add_package(
            "badPackageZipUrl",
            "1.0.0",
            &bug,
            &[],
            Some("ftp://wait/a/minute"),
            None,
        );
        server
    }

    /// Register a package; `dependencies` are `(alias, name, version)` triples
    /// of previously registered packages
    pub fn add_package(
        &mut self,
        name: &str,
        version: &str,
        files: &[(String, String)],
        dependencies: &[(&str, &str, &str)],
        zip_url: Option<&str>,
        zip_checksum: Option<&str>,
    ) {
        let entries: Vec<(&str, &str)> = files
            .iter()
            .map(|(name, contents)| (name.as_str(), contents.as_str()))
            .collect();
        let archive = zip_archive(&entries);
        let served_zip_url = format!("https://{}/{}@{}/{}@{}.zip", HOST, name, version, name, version);

        let mut deps = serde_json::Map::new();
        for (alias, dep_name, dep_version) in dependencies {
            let id = format!("{}@{}", dep_name, dep_version);
            deps.insert(
                alias.to_string(),
                json!({
                    "uri": format!("package://{}/{}", HOST, id),
                    "checksums": { "sha256": self.checksums[&id] }
                }),
            );
        }

        let metadata = json!({
            "name": name,
            "packageUri": format!("package://{}/{}@{}", HOST, name, version),
            "version": version,
            "packageZipUrl": zip_url.unwrap_or(&served_zip_url),
            "packageZipChecksums": {
                "sha256": zip_checksum
                    .map(str::to_string)
                    .unwrap_or_else(|| Checksums::compute(&archive).sha256)
            },
            "dependencies": deps,
            "license": "Apache-2.0",
            "authors": ["The Pkl Authors"]
        });
        let metadata = serde_json::to_vec_pretty(&metadata).unwrap();

        let id = format!("{}@{}", name, version);
        self.checksums
            .insert(id.clone(), Checksums::compute(&metadata).sha256);
        self.responses
            .insert(format!("https://{}/{}", HOST, id), metadata);
        self.responses.insert(served_zip_url, archive);
    }

    /// SHA-256 of the metadata document of `name@version`
    pub fn metadata_checksum(&self, id: &str) -> String {
        self.checksums[id].clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn fetches_of(&self, uri: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|fetched| fetched.as_str() == uri)
            .count()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }

    /// Fail every request with an I/O error while set
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every response
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Transport for FakePackageServer {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>, FetchError> {
        self.fetches.lock().unwrap().push(uri.to_string());
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Io {
                uri: uri.to_string(),
                message: "connection refused".to_string(),
            });
        }
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        self.responses
            .get(uri)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(uri.to_string()))
    }
}
