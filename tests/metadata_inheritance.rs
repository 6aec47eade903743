use std::fs;
use std::path::Path;

use broca::{entity_query, Layout, LayoutError};
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

/// Root-level sidecars of varying specificity plus one subject-level
/// override.
fn fixture() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path();
    write(
        root,
        "dataset_description.json",
        r#"{"Name": "Meta", "BIDSVersion": "1.8.0"}"#,
    );
    write(
        root,
        "bold.json",
        r#"{"Manufacturer": "ACME", "RepetitionTime": 9.0}"#,
    );
    write(
        root,
        "task-rest_bold.json",
        r#"{"RepetitionTime": 2.0, "Instruction": "lie still"}"#,
    );
    write(
        root,
        "sub-01/func/sub-01_task-rest_bold.json",
        r#"{"RepetitionTime": 3.0}"#,
    );
    touch(root, "sub-01/func/sub-01_task-rest_bold.nii.gz");
    touch(root, "sub-02/func/sub-02_task-rest_bold.nii.gz");
    touch(root, "sub-01/anat/sub-01_T1w.nii.gz");
    dir
}

#[test]
fn metadata_is_empty_until_indexed() {
    let dir = fixture();
    let layout = Layout::open(&[dir.path()]).expect("layout");
    assert!(layout.metadata().is_empty());
    let err = layout
        .get(&entity_query!("RepetitionTime": "2.0"))
        .unwrap_err();
    assert!(matches!(err, LayoutError::UnknownEntity(..)));
}

#[test]
fn deeper_sidecars_override_shallower_ones() {
    let dir = fixture();
    let layout = Layout::open(&[dir.path()])
        .expect("layout")
        .index_metadata()
        .expect("metadata");
    let matches = layout
        .get(&entity_query!("subject": "01", "suffix": "bold"))
        .expect("query");
    let one = matches.one().expect("one");
    let metadata = one.metadata().expect("resolved");
    assert_eq!(metadata.get("RepetitionTime").map(String::as_str), Some("3.0"));
    // Keys the deeper sidecar does not mention inherit from above.
    assert_eq!(
        metadata.get("Instruction").map(String::as_str),
        Some("lie still")
    );
    assert_eq!(
        metadata.get("Manufacturer").map(String::as_str),
        Some("ACME")
    );
}

#[test]
fn specificity_breaks_same_directory_ties() {
    let dir = fixture();
    let layout = Layout::open(&[dir.path()])
        .expect("layout")
        .index_metadata()
        .expect("metadata");
    // sub-02 has no dedicated sidecar: the root-level task-rest_bold.json
    // (one entity) overrides the blanket bold.json (no entities).
    let matches = layout
        .get(&entity_query!("subject": "02", "suffix": "bold"))
        .expect("query");
    let two = matches.one().expect("one");
    let metadata = two.metadata().expect("resolved");
    assert_eq!(metadata.get("RepetitionTime").map(String::as_str), Some("2.0"));
    assert_eq!(
        metadata.get("Manufacturer").map(String::as_str),
        Some("ACME")
    );
}

#[test]
fn suffix_gates_applicability() {
    let dir = fixture();
    let layout = Layout::open(&[dir.path()])
        .expect("layout")
        .index_metadata()
        .expect("metadata");
    let matches = layout
        .get(&entity_query!("suffix": "T1w"))
        .expect("query");
    let t1w = matches.one().expect("one");
    assert!(t1w.metadata().is_none());
}

#[test]
fn metadata_aggregate_mirrors_entities() {
    let dir = fixture();
    let layout = Layout::open(&[dir.path()])
        .expect("layout")
        .index_metadata()
        .expect("metadata");
    let aggregated = layout.metadata();
    let repetition = aggregated
        .iter()
        .find(|(key, _)| key == "RepetitionTime")
        .map(|(_, values)| values.clone())
        .expect("RepetitionTime");
    assert_eq!(repetition, vec!["2.0".to_string(), "3.0".to_string()]);
}

#[test]
fn metadata_keys_become_queryable() {
    let dir = fixture();
    let layout = Layout::open(&[dir.path()])
        .expect("layout")
        .index_metadata()
        .expect("metadata");
    let slow = layout
        .get(&entity_query!("RepetitionTime": "3.0"))
        .expect("query");
    assert_eq!(slow.len(), 1);
    assert!(slow.one().expect("one").path().contains("sub-01"));

    // Entity and metadata filters AND-compose.
    let none = layout
        .get(&entity_query!("subject": "02", "RepetitionTime": "3.0"))
        .expect("query");
    assert_eq!(none.len(), 0);
}

#[test]
fn indexing_is_idempotent() {
    let dir = fixture();
    let layout = Layout::open(&[dir.path()]).expect("layout");
    let first = layout.index_metadata().expect("first");
    let second = first.index_metadata().expect("second");
    assert_eq!(first.metadata(), second.metadata());
    assert_eq!(first.len(), second.len());
}

#[test]
fn malformed_sidecars_are_downgraded() {
    let dir = fixture();
    write(dir.path(), "sub-02/func/sub-02_task-rest_bold.json", "{not json");
    let layout = Layout::open(&[dir.path()])
        .expect("layout")
        .index_metadata()
        .expect("metadata");
    // The broken sidecar is ignored; inheritance from the root still works.
    let matches = layout
        .get(&entity_query!("subject": "02", "suffix": "bold"))
        .expect("query");
    let two = matches.one().expect("one");
    assert_eq!(
        two.metadata().expect("resolved").get("RepetitionTime").map(String::as_str),
        Some("2.0")
    );
}
