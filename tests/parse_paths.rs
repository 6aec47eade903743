use broca::entity::{long_to_short, short_to_long};
use broca::error::LayoutError;
use broca::parse::{parse, ParseMode, ParsedPath};

fn strict(path: &str) -> ParsedPath {
    parse(path, 0, 0, ParseMode::Strict).expect("strict parse")
}

fn permissive(path: &str) -> ParsedPath {
    parse(path, 0, 0, ParseMode::Permissive).expect("permissive parse")
}

#[test]
fn canonical_bids_path() {
    let parsed = strict("sub-01/func/sub-01_task-rest_bold.nii.gz");
    assert_eq!(parsed.entity("subject"), Some("01"));
    assert_eq!(parsed.entity("task"), Some("rest"));
    assert_eq!(parsed.datatype.as_deref(), Some("func"));
    assert_eq!(parsed.suffix.as_deref(), Some("bold"));
    assert_eq!(parsed.extension.as_deref(), Some(".nii.gz"));
    assert!(parsed.parts.is_empty());
}

#[test]
fn short_keys_normalize_to_long_names() {
    let parsed = strict("sub-01/anat/sub-01_acq-highres_ce-gad_T1w.nii.gz");
    assert_eq!(parsed.entity("acquisition"), Some("highres"));
    assert_eq!(parsed.entity("ceagent"), Some("gad"));
    // Short aliases resolve to the same values.
    assert_eq!(parsed.entity("acq"), Some("highres"));
    assert_eq!(parsed.entity("ce"), Some("gad"));
}

#[test]
fn multipart_extension_kept_whole() {
    let parsed = strict("sub-01/anat/sub-01_T1w.nii.gz");
    assert_eq!(parsed.suffix.as_deref(), Some("T1w"));
    assert_eq!(parsed.extension.as_deref(), Some(".nii.gz"));

    let parsed = strict("sub-01/func/sub-01_bold.json.gz");
    assert_eq!(parsed.extension.as_deref(), Some(".json.gz"));
}

#[test]
fn no_extension_leaves_suffix_only() {
    let parsed = strict("sub-01/anat/sub-01_T1w");
    assert_eq!(parsed.suffix.as_deref(), Some("T1w"));
    assert_eq!(parsed.extension, None);
}

#[test]
fn bare_filename_splits_at_first_dot() {
    let parsed = strict("data.json");
    assert_eq!(parsed.suffix.as_deref(), Some("data"));
    assert_eq!(parsed.extension.as_deref(), Some(".json"));
}

#[test]
fn trailing_keyval_token_gets_extension_but_no_suffix() {
    let parsed = strict("sub-01/anat/sub-01_desc-preproc.json");
    assert_eq!(parsed.entity("description"), Some("preproc"));
    assert_eq!(parsed.extension.as_deref(), Some(".json"));
    assert_eq!(parsed.suffix, None);
}

#[test]
fn unknown_entity_is_a_part_in_strict_mode() {
    let parsed = strict("sub-01/anat/sub-01_foobar-x_T1w.nii.gz");
    assert_eq!(parsed.entity("foobar"), None);
    assert_eq!(parsed.parts, vec!["foobar-x".to_string()]);
    assert_eq!(parsed.suffix.as_deref(), Some("T1w"));
}

#[test]
fn unknown_entity_is_kept_in_permissive_mode() {
    let parsed = permissive("sub-01/anat/sub-01_foobar-x_T1w.nii.gz");
    assert_eq!(parsed.entity("foobar"), Some("x"));
    assert!(parsed.parts.is_empty());
}

#[test]
fn directory_filename_mismatch_fails_strict() {
    let err = parse("sub-01/anat/sub-02_T1w.nii.gz", 0, 0, ParseMode::Strict).unwrap_err();
    match err {
        LayoutError::InconsistentEntity {
            entity,
            dir_value,
            file_value,
        } => {
            assert_eq!(entity, "subject");
            assert_eq!(dir_value, "01");
            assert_eq!(file_value, "02");
        }
        other => panic!("expected InconsistentEntity, got {other}"),
    }
}

#[test]
fn directory_filename_mismatch_survives_permissive() {
    let parsed = permissive("sub-01/anat/sub-02_T1w.nii.gz");
    assert_eq!(parsed.entity("subject"), Some("01"));
    assert_eq!(parsed.parts, vec!["sub-02".to_string()]);
}

#[test]
fn empty_value_fails_strict() {
    let err = parse("sub-01/anat/sub-01_acq-_T1w.nii.gz", 0, 0, ParseMode::Strict).unwrap_err();
    assert!(matches!(err, LayoutError::InvalidEntityValue(token) if token == "acq-"));
}

#[test]
fn empty_value_is_a_part_in_permissive_mode() {
    let parsed = permissive("sub-01/anat/sub-01_acq-_T1w.nii.gz");
    assert_eq!(parsed.parts, vec!["acq-".to_string()]);
    assert_eq!(parsed.suffix.as_deref(), Some("T1w"));
}

#[test]
fn datatype_recognized_only_in_penultimate_position() {
    let parsed = strict("sub-01/func/extra/sub-01_bold.nii.gz");
    assert_eq!(parsed.datatype, None);
    assert!(parsed.parts.contains(&"func".to_string()));
    assert!(parsed.parts.contains(&"extra".to_string()));
}

#[test]
fn permissive_promotes_bare_directory_to_datatype() {
    let parsed = permissive("sub-01/megapolis/sub-01_task-x_scan.nii");
    assert_eq!(parsed.datatype.as_deref(), Some("megapolis"));
}

#[test]
fn strict_keeps_unknown_penultimate_directory_as_part() {
    let parsed = strict("sub-01/megapolis/sub-01_task-x_scan.nii");
    assert_eq!(parsed.datatype, None);
    assert_eq!(parsed.parts, vec!["megapolis".to_string()]);
}

#[test]
fn parts_only_demotion_keeps_every_segment() {
    let parsed = ParsedPath::parts_only("/root/ds/sub-01/odd file.txt", 0, "/root/ds".len());
    assert_eq!(
        parsed.parts,
        vec!["sub-01".to_string(), "odd file.txt".to_string()]
    );
    assert!(parsed.entities.is_empty());
}

#[test]
fn alias_functions_are_a_bijection() {
    assert_eq!(long_to_short("subject").unwrap(), "sub");
    assert_eq!(short_to_long("sub").unwrap(), "subject");
    assert_eq!(long_to_short("ceagent").unwrap(), "ce");
    assert_eq!(short_to_long("ce").unwrap(), "ceagent");
    assert!(matches!(
        long_to_short("nonsense"),
        Err(LayoutError::UnknownEntity(..))
    ));
    assert!(matches!(
        short_to_long("nonsense"),
        Err(LayoutError::UnknownEntity(..))
    ));
}

#[test]
fn reconstructing_a_valid_path_from_entities_round_trips() {
    let original = "sub-01/ses-02/anat/sub-01_ses-02_run-03_T1w.nii.gz";
    let parsed = strict(original);

    let mut name_tokens: Vec<String> = parsed
        .entities
        .iter()
        .map(|(key, value)| format!("{}-{}", long_to_short(key).unwrap(), value))
        .collect();
    if let Some(suffix) = &parsed.suffix {
        name_tokens.push(suffix.clone());
    }
    let mut rebuilt = String::new();
    rebuilt.push_str(&format!("sub-{}/", parsed.entity("subject").unwrap()));
    rebuilt.push_str(&format!("ses-{}/", parsed.entity("session").unwrap()));
    rebuilt.push_str(&format!("{}/", parsed.datatype.as_deref().unwrap()));
    rebuilt.push_str(&name_tokens.join("_"));
    rebuilt.push_str(parsed.extension.as_deref().unwrap());
    assert_eq!(rebuilt, original);
}
