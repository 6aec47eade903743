use std::fs;
use std::path::Path;

use broca::{DerivativesSpec, Layout, LayoutError, LayoutOptions};
use tempfile::TempDir;

fn touch(root: &Path, rel: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, b"").expect("touch");
}

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, contents).expect("write");
}

fn fixture() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path();
    write(
        root,
        "dataset_description.json",
        r#"{"Name": "Cached", "BIDSVersion": "1.8.0"}"#,
    );
    touch(root, "sub-01/anat/sub-01_T1w.nii.gz");
    touch(root, "sub-01/func/sub-01_task-rest_bold.nii.gz");
    write(
        root,
        "sub-01/func/sub-01_task-rest_bold.json",
        r#"{"RepetitionTime": 2.0}"#,
    );
    touch(root, "sub-02/anat/sub-02_T1w.nii.gz");
    write(
        root,
        "derivatives/fmriprep/dataset_description.json",
        r#"{"Name": "fMRIPrep", "GeneratedBy": [{"Name": "fMRIPrep"}]}"#,
    );
    touch(
        root,
        "derivatives/fmriprep/sub-01/anat/sub-01_space-MNI_desc-preproc_T1w.nii.gz",
    );
    dir
}

fn paths(layout: &Layout) -> Vec<String> {
    layout.iter().map(|f| f.path().to_string()).collect()
}

#[test]
fn save_then_load_is_faithful() {
    let dir = fixture();
    let cache_dir = TempDir::new().expect("cache dir");
    let cache = cache_dir.path().join("layout.cache");

    let original = Layout::open_with(
        &[dir.path()],
        LayoutOptions {
            derivatives: DerivativesSpec::Auto,
            ..Default::default()
        },
    )
    .expect("layout")
    .index_metadata()
    .expect("metadata");
    original.save(&cache).expect("save");

    let restored = Layout::load(&cache).expect("load");
    assert_eq!(paths(&original), paths(&restored));
    assert_eq!(original.entities(), restored.entities());
    assert_eq!(original.metadata(), restored.metadata());
    assert_eq!(original.roots(), restored.roots());
    assert_eq!(
        original
            .description()
            .expect("description")
            .expect("present")
            .name,
        restored
            .description()
            .expect("description")
            .expect("present")
            .name
    );
}

#[test]
fn metadata_block_is_optional() {
    let dir = fixture();
    let cache_dir = TempDir::new().expect("cache dir");
    let cache = cache_dir.path().join("layout.cache");

    let original = Layout::open(&[dir.path()]).expect("layout");
    original.save(&cache).expect("save");
    let restored = Layout::load(&cache).expect("load");
    assert!(restored.metadata().is_empty());
}

#[test]
fn wrong_magic_is_rejected() {
    let cache_dir = TempDir::new().expect("cache dir");
    let cache = cache_dir.path().join("layout.cache");
    fs::write(&cache, b"XXXXsome nonsense").expect("write");
    let err = Layout::load(&cache).unwrap_err();
    assert!(matches!(err, LayoutError::CacheIncompatible(..)));
}

#[test]
fn unknown_version_is_rejected() {
    let dir = fixture();
    let cache_dir = TempDir::new().expect("cache dir");
    let cache = cache_dir.path().join("layout.cache");
    Layout::open(&[dir.path()])
        .expect("layout")
        .save(&cache)
        .expect("save");

    let mut bytes = fs::read(&cache).expect("read");
    bytes[4] = 0xFF;
    fs::write(&cache, &bytes).expect("rewrite");
    let err = Layout::load(&cache).unwrap_err();
    assert!(matches!(err, LayoutError::CacheIncompatible(reason) if reason.contains("version")));
}

#[test]
fn corrupt_payload_fails_the_checksum() {
    let dir = fixture();
    let cache_dir = TempDir::new().expect("cache dir");
    let cache = cache_dir.path().join("layout.cache");
    Layout::open(&[dir.path()])
        .expect("layout")
        .save(&cache)
        .expect("save");

    let mut bytes = fs::read(&cache).expect("read");
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    fs::write(&cache, &bytes).expect("rewrite");
    assert!(matches!(
        Layout::load(&cache),
        Err(LayoutError::CacheIncompatible(..))
    ));
}

#[test]
fn truncated_cache_is_rejected() {
    let dir = fixture();
    let cache_dir = TempDir::new().expect("cache dir");
    let cache = cache_dir.path().join("layout.cache");
    Layout::open(&[dir.path()])
        .expect("layout")
        .save(&cache)
        .expect("save");

    let bytes = fs::read(&cache).expect("read");
    fs::write(&cache, &bytes[..bytes.len() / 3]).expect("rewrite");
    assert!(matches!(
        Layout::load(&cache),
        Err(LayoutError::CacheIncompatible(..))
    ));
}

#[test]
fn construction_prefers_a_matching_cache() {
    let dir = fixture();
    let cache_dir = TempDir::new().expect("cache dir");
    let cache = cache_dir.path().join("layout.cache");
    let options = LayoutOptions {
        cache: Some(cache.clone()),
        ..Default::default()
    };

    let first = Layout::open_with(&[dir.path()], options.clone()).expect("first");
    assert!(cache.is_file());

    // Remove a file on disk: a cache hit must keep serving the old walk.
    fs::remove_file(dir.path().join("sub-02/anat/sub-02_T1w.nii.gz")).expect("remove");
    let cached = Layout::open_with(&[dir.path()], options.clone()).expect("cached");
    assert_eq!(paths(&first), paths(&cached));

    // reset_cache forces a walk and rewrites the cache.
    let rebuilt = Layout::open_with(
        &[dir.path()],
        LayoutOptions {
            reset_cache: true,
            ..options
        },
    )
    .expect("rebuilt");
    assert_eq!(rebuilt.len(), first.len() - 1);
}

#[test]
fn cache_with_different_dataset_table_is_discarded() {
    let dir = fixture();
    let cache_dir = TempDir::new().expect("cache dir");
    let cache = cache_dir.path().join("layout.cache");

    let plain = Layout::open_with(
        &[dir.path()],
        LayoutOptions {
            cache: Some(cache.clone()),
            ..Default::default()
        },
    )
    .expect("plain");

    // Same cache path, but the request now declares a derivative dataset:
    // the cached table no longer matches and a fresh walk happens.
    let with_derivatives = Layout::open_with(
        &[dir.path()],
        LayoutOptions {
            derivatives: DerivativesSpec::Auto,
            cache: Some(cache.clone()),
            ..Default::default()
        },
    )
    .expect("with derivatives");
    // Without the derivative dataset declared, its files counted as raw.
    assert_eq!(plain.roots().len(), 1);
    assert_eq!(with_derivatives.roots().len(), 2);
    assert_eq!(with_derivatives.len(), plain.len());
    let raw = with_derivatives
        .filter(None, Some(&["raw"]))
        .expect("scope");
    assert_eq!(raw.len(), plain.len() - 1);
}
