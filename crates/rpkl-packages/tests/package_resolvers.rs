mod common;

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{FakePackageServer, BIRD_PKL, SWALLOW_PKL};
use rpkl_packages::packages::WriterProgress;
use rpkl_packages::{
    DiskCachedPackageResolver, Error, InMemoryPackageResolver, PackageAssetUri, PackageResolver,
    PackageUri, PathElement, SecurityManagers,
};

fn asset(uri: &str) -> PackageAssetUri {
    PackageAssetUri::parse(uri).unwrap()
}

/// Run `check` against a fresh disk-backed and a fresh in-memory resolver
fn with_resolvers(check: impl Fn(&dyn PackageResolver, &FakePackageServer)) {
    let server = Arc::new(FakePackageServer::new());
    let cache = tempfile::tempdir().unwrap();
    let disk = DiskCachedPackageResolver::new(
        cache.path(),
        server.clone(),
        SecurityManagers::standard(),
    )
    .unwrap();
    check(&disk, &server);

    let server = Arc::new(FakePackageServer::new());
    let memory = InMemoryPackageResolver::new(server.clone(), SecurityManagers::standard());
    check(&memory, &server);
}

#[test]
fn get_module_bytes() {
    with_resolvers(|resolver, _| {
        let bytes = resolver
            .get_bytes(&asset("package://localhost:0/birds@0.5.0#/Bird.pkl"), false, None)
            .unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), BIRD_PKL);
    });
}

#[test]
fn get_module_bytes_resolving_path() {
    with_resolvers(|resolver, _| {
        let text = resolver
            .get_text(&asset("package://localhost:0/birds@0.5.0#/foo/../Bird.pkl"), None)
            .unwrap();
        assert_eq!(text, BIRD_PKL);
    });
}

#[test]
fn get_directory() {
    with_resolvers(|resolver, _| {
        let err = resolver
            .get_bytes(&asset("package://localhost:0/birds@0.5.0#/"), false, None)
            .unwrap_err();
        assert!(matches!(err, Error::IsADirectory(_)), "{:?}", err);
    });
}

#[test]
fn get_directory_allowing_directory_reads() {
    with_resolvers(|resolver, _| {
        let bytes = resolver
            .get_bytes(&asset("package://localhost:0/birds@0.5.0#/"), true, None)
            .unwrap();
        insta::allow_duplicates! {
            insta::assert_snapshot!(String::from_utf8(bytes).unwrap(), @r###"
            Bird.pkl
            allFruit.pkl
            catalog
            catalog.pkl
            some
            "###);
        }

        let bytes = resolver
            .get_bytes(&asset("package://localhost:0/birds@0.5.0#/catalog"), true, None)
            .unwrap();
        assert_eq!(bytes, b"Ostritch.pkl\nSwallow.pkl\n");
    });
}

#[test]
fn directory_listing_bytes_are_exact() {
    with_resolvers(|resolver, _| {
        let bytes = resolver
            .get_bytes(&asset("package://localhost:0/birds@0.5.0#/"), true, None)
            .unwrap();
        assert_eq!(bytes, b"Bird.pkl\nallFruit.pkl\ncatalog\ncatalog.pkl\nsome\n");
    });
}

#[test]
fn list_path_elements_at_root() {
    with_resolvers(|resolver, _| {
        let elements = resolver
            .list_elements(&asset("package://localhost:0/birds@0.5.0#/"), None)
            .unwrap();
        let expected: HashSet<PathElement> = [
            PathElement::new("some", true),
            PathElement::new("catalog", true),
            PathElement::new("Bird.pkl", false),
            PathElement::new("allFruit.pkl", false),
            PathElement::new("catalog.pkl", false),
        ]
        .into_iter()
        .collect();
        assert_eq!(elements, expected);
    });
}

#[test]
fn list_path_elements_in_nested_directory() {
    with_resolvers(|resolver, _| {
        let elements = resolver
            .list_elements(&asset("package://localhost:0/birds@0.5.0#/catalog/"), None)
            .unwrap();
        let expected: HashSet<PathElement> = [
            PathElement::new("Ostritch.pkl", false),
            PathElement::new("Swallow.pkl", false),
        ]
        .into_iter()
        .collect();
        assert_eq!(elements, expected);

        let err = resolver
            .list_elements(&asset("package://localhost:0/birds@0.5.0#/Bird.pkl"), None)
            .unwrap_err();
        assert!(matches!(err, Error::NotADirectory(_)), "{:?}", err);
    });
}

#[test]
fn get_multiple_assets_fetches_once() {
    with_resolvers(|resolver, server| {
        let bird = resolver
            .get_bytes(&asset("package://localhost:0/birds@0.5.0#/Bird.pkl"), false, None)
            .unwrap();
        let swallow = resolver
            .get_bytes(
                &asset("package://localhost:0/birds@0.5.0#/catalog/Swallow.pkl"),
                false,
                None,
            )
            .unwrap();
        assert_eq!(bird, BIRD_PKL.as_bytes());
        assert_eq!(swallow, SWALLOW_PKL.as_bytes());
        assert_eq!(
            server.fetched(),
            [
                "https://localhost:0/birds@0.5.0",
                "https://localhost:0/birds@0.5.0/birds@0.5.0.zip",
            ]
        );
    });
}

#[test]
fn percent_encoded_asset_paths_are_decoded() {
    with_resolvers(|resolver, _| {
        let egret = asset("package://localhost:0/spaced@1.0.0#/catalog/Great%20Egret.pkl");
        let text = resolver.get_text(&egret, None).unwrap();
        assert!(text.contains("name = \"Great Egret\""));
        assert!(resolver.has_element(&egret, None).unwrap());

        let elements = resolver
            .list_elements(&asset("package://localhost:0/spaced@1.0.0#/catalog/"), None)
            .unwrap();
        assert_eq!(
            elements,
            HashSet::from([PathElement::new("Great Egret.pkl", false)])
        );
    });
}

#[test]
fn asset_not_found_in_existing_package() {
    with_resolvers(|resolver, _| {
        let err = resolver
            .get_bytes(&asset("package://localhost:0/birds@0.5.0#/Horse.pkl"), false, None)
            .unwrap_err();
        assert_eq!(
            err,
            Error::AssetNotFound("package://localhost:0/birds@0.5.0#/Horse.pkl".to_string())
        );
        assert!(!resolver
            .has_element(&asset("package://localhost:0/birds@0.5.0#/Horse.pkl"), None)
            .unwrap());
        assert!(resolver
            .has_element(&asset("package://localhost:0/birds@0.5.0#/some/dir"), None)
            .unwrap());
    });
}

#[test]
fn package_load_error_if_package_does_not_exist() {
    with_resolvers(|resolver, _| {
        let err = resolver
            .get_bytes(
                &asset("package://localhost:0/not-a-package@0.5.0#/Horse.pkl"),
                false,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::PackageLoad(_)), "{:?}", err);
        assert!(err.to_string().contains("package://localhost:0/not-a-package@0.5.0"));
    });
}

#[test]
fn requires_package_zip_to_be_an_https_uri() {
    with_resolvers(|resolver, server| {
        let err = resolver
            .get_bytes(
                &asset("package://localhost:0/badPackageZipUrl@1.0.0#/Bug.pkl"),
                false,
                None,
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Expected the zip asset for package `package://localhost:0/badPackageZipUrl@1.0.0` to be an HTTPS URI, but got `ftp://wait/a/minute`."
        );
        assert_eq!(server.fetches_of("ftp://wait/a/minute"), 0);
    });
}

#[test]
fn throws_if_package_checksum_is_invalid() {
    with_resolvers(|resolver, _| {
        let err = resolver
            .get_bytes(
                &asset("package://localhost:0/badChecksum@1.0.0#/Bug.pkl"),
                false,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::PackageLoad(_)), "{:?}", err);
        let message = err.to_string();
        let computed = message
            .lines()
            .find_map(|line| line.strip_prefix("Computed checksum: \""))
            .and_then(|rest| rest.strip_suffix('"'))
            .unwrap();
        assert_eq!(computed.len(), 64);
        assert!(message.contains("Expected checksum: \"intentionally bogus checksum\""));
        assert!(message.contains("package://localhost:0/badChecksum@1.0.0"));
    });
}

#[test]
fn checksum_pin_is_verified() {
    with_resolvers(|resolver, server| {
        let good = format!(
            "package://localhost:0/birds@0.5.0::sha256:{}#/Bird.pkl",
            server.metadata_checksum("birds@0.5.0")
        );
        assert!(resolver.get_bytes(&asset(&good), false, None).is_ok());

        let bad = asset("package://localhost:0/birds@0.5.0::sha256:deadbeef#/Bird.pkl");
        let err = resolver.get_bytes(&bad, false, None).unwrap_err();
        assert!(matches!(err, Error::PackageLoad(_)), "{:?}", err);
        assert!(err.to_string().contains("Expected checksum: \"deadbeef\""));
    });
}

#[test]
fn dependency_metadata_does_not_download_archive() {
    with_resolvers(|resolver, server| {
        let package = PackageUri::parse("package://localhost:0/birds@0.5.0").unwrap();
        let (metadata, checksums) = resolver.get_dependency_metadata(&package, None).unwrap();
        assert_eq!(metadata.name, "birds");
        assert_eq!(checksums.sha256, server.metadata_checksum("birds@0.5.0"));
        assert_eq!(
            metadata.dependencies["fruities"].uri,
            "package://localhost:0/fruit@1.0.5"
        );
        assert_eq!(server.fetched(), ["https://localhost:0/birds@0.5.0"]);
    });
}

#[test]
fn rejects_project_package_uris() {
    with_resolvers(|resolver, server| {
        let err = resolver
            .get_bytes(
                &asset("projectpackage://localhost:0/birds@0.5.0#/Bird.pkl"),
                false,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{:?}", err);
        assert_eq!(server.fetch_count(), 0);
    });
}

#[test]
fn security_manager_is_consulted_before_fetching() {
    let server = Arc::new(FakePackageServer::new());
    let security =
        rpkl_packages::StandardSecurityManager::new(["file:"], Vec::<String>::new()).unwrap();
    let resolver = InMemoryPackageResolver::new(server.clone(), Arc::new(security));
    let err = resolver
        .get_bytes(&asset("package://localhost:0/birds@0.5.0#/Bird.pkl"), false, None)
        .unwrap_err();
    assert!(matches!(err, Error::Security(_)), "{:?}", err);
    assert_eq!(server.fetch_count(), 0);
}

#[test]
fn progress_is_reported() {
    with_resolvers(|resolver, _| {
        let progress = WriterProgress::new(Vec::new());
        resolver
            .download_package(
                &PackageUri::parse("package://localhost:0/birds@0.5.0").unwrap(),
                Some(&progress),
            )
            .unwrap();
        let output = String::from_utf8(progress.into_inner()).unwrap();
        insta::allow_duplicates! {
            insta::assert_snapshot!(output, @r###"
            Downloading metadata for package `package://localhost:0/birds@0.5.0`
            Downloading package `package://localhost:0/birds@0.5.0`
            "###);
        }
    });
}

#[test]
fn failed_metadata_fetch_is_retried() {
    with_resolvers(|resolver, server| {
        let bird = asset("package://localhost:0/birds@0.5.0#/Bird.pkl");
        server.set_offline(true);
        let err = resolver.get_bytes(&bird, false, None).unwrap_err();
        assert!(matches!(err, Error::PackageLoad(_)), "{:?}", err);

        server.set_offline(false);
        assert_eq!(resolver.get_bytes(&bird, false, None).unwrap(), BIRD_PKL.as_bytes());
        assert_eq!(server.fetches_of("https://localhost:0/birds@0.5.0"), 2);
    });
}

#[test]
fn concurrent_requests_share_one_fetch() {
    let server = Arc::new(FakePackageServer::new());
    server.set_delay(Duration::from_millis(50));
    let cache = tempfile::tempdir().unwrap();
    let resolver = Arc::new(
        DiskCachedPackageResolver::new(cache.path(), server.clone(), SecurityManagers::standard())
            .unwrap(),
    );

    let handles: Vec<_> = ["Bird.pkl", "catalog/Swallow.pkl", "catalog.pkl", "Bird.pkl"]
        .into_iter()
        .map(|path| {
            let resolver = Arc::clone(&resolver);
            thread::spawn(move || {
                let uri = format!("package://localhost:0/birds@0.5.0#/{}", path);
                resolver.get_bytes(&asset(&uri), false, None)
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }

    assert_eq!(server.fetches_of("https://localhost:0/birds@0.5.0"), 1);
    assert_eq!(
        server.fetches_of("https://localhost:0/birds@0.5.0/birds@0.5.0.zip"),
        1
    );
}

fn files_under(dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let relative = path.strip_prefix(dir).unwrap();
                files.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    files.sort();
    files
}

#[cfg(unix)]
#[test]
fn disk_cache_mirrors_archive_and_survives_restart() {
    let server = Arc::new(FakePackageServer::new());
    let cache = tempfile::tempdir().unwrap();
    let resolver =
        DiskCachedPackageResolver::new(cache.path(), server.clone(), SecurityManagers::standard())
            .unwrap();
    resolver
        .get_bytes(&asset("package://localhost:0/birds@0.5.0#/Bird.pkl"), false, None)
        .unwrap();

    let package_dir = cache.path().join("package-1/localhost:0/birds@0.5.0");
    assert_eq!(
        files_under(&package_dir),
        [
            "Bird.pkl",
            "allFruit.pkl",
            "catalog.pkl",
            "catalog/Ostritch.pkl",
            "catalog/Swallow.pkl",
            "some/dir/Bird.pkl",
        ]
    );
    assert!(cache
        .path()
        .join("package-1/localhost:0/birds@0.5.0.json")
        .is_file());
    let fetches = server.fetch_count();

    // a new resolver over the same cache directory does not touch the network
    let restarted =
        DiskCachedPackageResolver::new(cache.path(), server.clone(), SecurityManagers::standard())
            .unwrap();
    let swallow = restarted
        .get_bytes(
            &asset("package://localhost:0/birds@0.5.0#/catalog/Swallow.pkl"),
            false,
            None,
        )
        .unwrap();
    assert_eq!(swallow, SWALLOW_PKL.as_bytes());
    assert_eq!(server.fetch_count(), fetches);
}

#[test]
fn failed_downloads_leave_no_cache_entry() {
    let server = Arc::new(FakePackageServer::new());
    let cache = tempfile::tempdir().unwrap();
    let resolver =
        DiskCachedPackageResolver::new(cache.path(), server.clone(), SecurityManagers::standard())
            .unwrap();
    assert!(resolver
        .get_bytes(&asset("package://localhost:0/badChecksum@1.0.0#/Bug.pkl"), false, None)
        .is_err());

    let package_dir = PackageUri::parse("package://localhost:0/badChecksum@1.0.0")
        .unwrap()
        .cache_path(cache.path());
    assert!(!package_dir.exists());
}
