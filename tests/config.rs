use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use kira_coexpression::config::{Config, ConfigLoader, MatrixEntry, Overrides};
use kira_coexpression::domain::SampleKey;
use kira_coexpression::error::KiraError;
use kira_coexpression::retry::RetryPolicy;

#[test]
fn resolve_from_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-cx.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "dataset_id": "GSE300437",
            "target_feature": "Polb",
            "cache_root": "cache",
            "matrices": ["in-vivo=GSE300437_liver.txt.gz"]
        }"#,
    )
    .unwrap();

    let resolved =
        ConfigLoader::resolve(Some(path.to_str().unwrap()), Overrides::default()).unwrap();
    assert_eq!(resolved.dataset_id.as_str(), "GSE300437");
    assert_eq!(resolved.target_feature, "Polb");
    assert_eq!(resolved.cache_root.as_str(), "cache");
    assert_eq!(resolved.matrices[0].group.as_str(), "in-vivo");
    assert_eq!(resolved.sample_key, SampleKey::Accession);
}

#[test]
fn cli_overrides_file_values() {
    let config = Config {
        dataset_id: Some("GSE1".to_string()),
        target_feature: Some("GeneA".to_string()),
        cache_root: Some("a".to_string()),
        matrices: vec![MatrixEntry::Shorthand("tissue=GSE1_counts.txt".to_string())],
        ..Config::default()
    };
    let overrides = Overrides {
        dataset_id: Some("GSE2".to_string()),
        target_feature: None,
        cache_root: Some("b".to_string()),
    };
    let resolved = ConfigLoader::resolve_config(config, overrides).unwrap();
    assert_eq!(resolved.dataset_id.as_str(), "GSE2");
    assert_eq!(resolved.target_feature, "GeneA");
    assert_eq!(resolved.cache_root.as_str(), "b");
}

#[test]
fn missing_explicit_file_is_a_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(Some(path.to_str().unwrap()), Overrides::default())
        .unwrap_err();
    assert_matches!(err, KiraError::ConfigRead(_));
}

#[test]
fn malformed_json_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-cx.json");
    fs::write(&path, "{ \"dataset_id\": ").unwrap();
    let err = ConfigLoader::resolve(Some(path.to_str().unwrap()), Overrides::default())
        .unwrap_err();
    assert_matches!(err, KiraError::ConfigParse(_));
}

#[test]
fn empty_matrix_list_is_rejected() {
    let config = Config {
        dataset_id: Some("GSE1".to_string()),
        target_feature: Some("GeneA".to_string()),
        cache_root: Some("a".to_string()),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config, Overrides::default()),
        Err(KiraError::InvalidConfig(_))
    );
}

#[test]
fn out_of_range_threshold_is_rejected() {
    let config = Config {
        dataset_id: Some("GSE1".to_string()),
        target_feature: Some("GeneA".to_string()),
        cache_root: Some("a".to_string()),
        p_threshold: Some(0.0),
        matrices: vec![MatrixEntry::Shorthand("tissue=GSE1_counts.txt".to_string())],
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config, Overrides::default()),
        Err(KiraError::InvalidConfig(message)) if message.contains("p_threshold")
    );
}

#[test]
fn dataset_settings_follow_the_config_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-cx.json");
    // No dataset, target or matrices: the dataset commands do not need them.
    fs::write(
        &path,
        r#"{
            "cache_root": "from-file",
            "retry_count": 1,
            "retry_backoff_ms": 20,
            "network_timeout_secs": 7
        }"#,
    )
    .unwrap();
    let path = path.to_str().unwrap();

    let settings = ConfigLoader::dataset_settings(Some(path), None).unwrap();
    assert_eq!(settings.cache_root.as_str(), "from-file");
    assert_eq!(settings.retry, RetryPolicy::new(1, Duration::from_millis(20)));
    assert_eq!(settings.network_timeout, Duration::from_secs(7));

    let settings = ConfigLoader::dataset_settings(Some(path), Some("cli".to_string())).unwrap();
    assert_eq!(settings.cache_root.as_str(), "cli");
    assert_eq!(settings.network_timeout, Duration::from_secs(7));
}

#[test]
fn dataset_settings_reject_a_zero_timeout() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-cx.json");
    fs::write(&path, r#"{ "network_timeout_secs": 0 }"#).unwrap();
    assert_matches!(
        ConfigLoader::dataset_settings(path.to_str(), Some("cache".to_string())),
        Err(KiraError::InvalidConfig(message)) if message.contains("network_timeout_secs")
    );
}

#[test]
fn marker_panel_from_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-cx.json");
    fs::write(
        &path,
        r#"{
            "dataset_id": "GSE300437",
            "target_feature": "Polb",
            "cache_root": "cache",
            "matrices": ["in-vivo=GSE300437_liver.txt.gz"],
            "marker_panel": {
                "Hedgehog": ["Ptch1", "Smo"],
                "Classic": ["Acta2", "Vim", "Col1a1", "Col3a1"]
            }
        }"#,
    )
    .unwrap();

    let resolved =
        ConfigLoader::resolve(Some(path.to_str().unwrap()), Overrides::default()).unwrap();
    assert_eq!(resolved.marker_panel.len(), 2);
    assert_eq!(resolved.marker_panel[0].category, "Classic");
    assert_eq!(resolved.marker_panel[1].features, ["Ptch1", "Smo"]);
}
