//! Template directory and single-arch list loading from disk.

use std::fs;

use qem_core::config::{
    load_settings_file, load_singlearch, load_template_file, load_templates, yaml_files,
};
use tempfile::TempDir;

const SLES: &str = r#"
product: SLES
settings:
  VERSION: 15-SP4
  DISTRI: sle
incidents:
  FLAVOR:
    Server-DVD-Incidents:
      archs: !concat [[x86_64, aarch64], s390x]
      issues:
        OS_TEST_ISSUES: SLES:15-SP4
      packages: !concat [[kernel-default], kernel-source]
    Server-DVD-Incidents-Kernel:
      archs: [x86_64]
      issues:
        OS_TEST_ISSUES: SLES:15-SP4
"#;

const AGGREGATE_ONLY: &str = r#"
product: SLES
settings: {VERSION: 15-SP4, DISTRI: sle}
aggregate:
  FLAVOR: Server-DVD-Updates
  archs: [x86_64]
"#;

#[test]
fn directory_loads_sorted_and_skips_bad_files() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("b-sles.yml"), SLES).unwrap();
    fs::write(dir.path().join("a-aggregate.yaml"), AGGREGATE_ONLY).unwrap();
    fs::write(dir.path().join("c-broken.yml"), "product: [unterminated\n").unwrap();
    fs::write(dir.path().join("d-empty.yml"), "").unwrap();
    fs::write(dir.path().join("e-nosettings.yml"), "product: SLES\n").unwrap();
    fs::write(dir.path().join("README.md"), "not yaml").unwrap();

    let files = yaml_files(dir.path()).unwrap();
    let names: Vec<String> = files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "a-aggregate.yaml",
            "b-sles.yml",
            "c-broken.yml",
            "d-empty.yml",
            "e-nosettings.yml"
        ]
    );

    let templates = load_templates(dir.path()).unwrap();
    assert_eq!(templates.len(), 1);
    let sles = &templates[0];
    assert_eq!(sles.product, "SLES");
    assert_eq!(sles.flavors.len(), 2);
    assert_eq!(sles.flavors[0].archs, vec!["x86_64", "aarch64", "s390x"]);
    assert_eq!(
        sles.flavors[0].packages.as_deref(),
        Some(&["kernel-default".to_string(), "kernel-source".to_string()][..])
    );
}

#[test]
fn single_file_path_is_accepted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sles.yml");
    fs::write(&path, SLES).unwrap();

    assert_eq!(load_templates(&path).unwrap().len(), 1);
    assert!(load_template_file(&path).unwrap().is_some());
}

#[test]
fn missing_directory_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(load_templates(&dir.path().join("absent")).is_err());
}

#[test]
fn singlearch_list() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("singlearch.yml");
    fs::write(&path, "- kernel-64kb\n- kernel-zfcpdump\n").unwrap();

    let packages = load_singlearch(&path);
    assert_eq!(packages.len(), 2);
    assert!(packages.contains("kernel-64kb"));

    assert!(load_singlearch(&dir.path().join("absent.yml")).is_empty());

    fs::write(&path, "").unwrap();
    assert!(load_singlearch(&path).is_empty());
}

#[test]
fn settings_are_read_without_incidents_section() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("aggregate.yml");
    fs::write(&path, AGGREGATE_ONLY).unwrap();

    let settings = load_settings_file(&path).unwrap().unwrap();
    assert_eq!(settings.get("VERSION").map(String::as_str), Some("15-SP4"));

    fs::write(&path, "product: SLES\n").unwrap();
    assert!(load_settings_file(&path).unwrap().is_none());
}
