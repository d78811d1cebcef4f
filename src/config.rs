use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{DatasetId, GroupLabel, SampleKey};
use crate::error::KiraError;
use crate::correlation::MarkerCategory;
use crate::matrix::MatrixSpec;
use crate::retry::RetryPolicy;
use crate::store;

pub const DEFAULT_CONFIG_FILE: &str = "kira-cx.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub target_feature: Option<String>,
    #[serde(default)]
    pub cache_root: Option<String>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
    #[serde(default)]
    pub network_timeout_secs: Option<u64>,
    #[serde(default)]
    pub sample_key: Option<SampleKey>,
    #[serde(default)]
    pub group_attribute: Option<String>,
    #[serde(default)]
    pub include_groups: Vec<String>,
    #[serde(default)]
    pub p_threshold: Option<f64>,
    #[serde(default)]
    pub matrices: Vec<MatrixEntry>,
    /// Category name to the features reported under it.
    #[serde(default)]
    pub marker_panel: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MatrixEntry {
    /// `"group=file"`
    Shorthand(String),
    Detailed(MatrixEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MatrixEntryObject {
    pub group: String,
    pub file: String,
    #[serde(default)]
    pub id_column: Option<String>,
    #[serde(default)]
    pub annotation_columns: Vec<String>,
}

/// Values supplied on the command line; each one wins over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub dataset_id: Option<String>,
    pub target_feature: Option<String>,
    pub cache_root: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub dataset_id: DatasetId,
    pub target_feature: String,
    pub cache_root: Utf8PathBuf,
    pub retry: RetryPolicy,
    pub network_timeout: Duration,
    pub sample_key: SampleKey,
    pub group_attribute: Option<String>,
    pub include_groups: Vec<GroupLabel>,
    pub p_threshold: f64,
    pub matrices: Vec<MatrixSpec>,
    pub marker_panel: Vec<MarkerCategory>,
}

/// What the dataset-level commands (`files`, `clear`) need from a config
/// file. Everything else in the file is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSettings {
    pub cache_root: Utf8PathBuf,
    pub retry: RetryPolicy,
    pub network_timeout: Duration,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>, overrides: Overrides) -> Result<ResolvedConfig, KiraError> {
        let config = Self::read(path)?.ok_or(KiraError::MissingConfig)?;
        Self::resolve_config(config, overrides)
    }

    /// Reads the config file. A missing default file is `Ok(None)`; a missing
    /// explicit path is an error.
    pub fn read(path: Option<&str>) -> Result<Option<Config>, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;
        Ok(Some(config))
    }

    /// Cache root and network settings, from the config file when there is
    /// one and from defaults otherwise. `cache_root` wins over the file.
    pub fn dataset_settings(
        path: Option<&str>,
        cache_root: Option<String>,
    ) -> Result<DatasetSettings, KiraError> {
        let config = Self::read(path)?.unwrap_or_default();
        let retry = retry_policy(&config);
        let network_timeout = network_timeout(&config)?;
        Ok(DatasetSettings {
            cache_root: resolve_cache_root(cache_root.or(config.cache_root))?,
            retry,
            network_timeout,
        })
    }

    pub fn resolve_config(
        config: Config,
        overrides: Overrides,
    ) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let retry = retry_policy(&config);
        let network_timeout = network_timeout(&config)?;

        let dataset_id: DatasetId = overrides
            .dataset_id
            .or(config.dataset_id)
            .ok_or_else(|| KiraError::InvalidConfig("dataset_id is required".to_string()))?
            .parse()?;

        let target_feature = overrides
            .target_feature
            .or(config.target_feature)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| KiraError::InvalidConfig("target_feature is required".to_string()))?;

        let cache_root = resolve_cache_root(overrides.cache_root.or(config.cache_root))?;

        let p_threshold = config.p_threshold.unwrap_or(0.05);
        if !(p_threshold > 0.0 && p_threshold <= 1.0) {
            return Err(KiraError::InvalidConfig(format!(
                "p_threshold must be in (0, 1], got {p_threshold}"
            )));
        }

        let include_groups = config
            .include_groups
            .iter()
            .map(|value| value.parse())
            .collect::<Result<Vec<GroupLabel>, KiraError>>()?;
        if !include_groups.is_empty() && config.group_attribute.is_none() {
            return Err(KiraError::InvalidConfig(
                "include_groups needs group_attribute to label samples".to_string(),
            ));
        }

        let matrices = config
            .matrices
            .into_iter()
            .map(resolve_matrix)
            .collect::<Result<Vec<_>, KiraError>>()?;
        validate_matrices(&matrices)?;
        let marker_panel = resolve_marker_panel(config.marker_panel)?;

        Ok(ResolvedConfig {
            schema_version,
            dataset_id,
            target_feature,
            cache_root,
            retry,
            network_timeout,
            sample_key: config.sample_key.unwrap_or_default(),
            group_attribute: config.group_attribute,
            include_groups,
            p_threshold,
            matrices,
            marker_panel,
        })
    }
}

fn resolve_cache_root(root: Option<String>) -> Result<Utf8PathBuf, KiraError> {
    match root {
        Some(root) => Ok(Utf8PathBuf::from(root)),
        None => store::default_cache_root(),
    }
}

fn retry_policy(config: &Config) -> RetryPolicy {
    RetryPolicy::new(
        config.retry_count.unwrap_or(3),
        Duration::from_millis(config.retry_backoff_ms.unwrap_or(500)),
    )
}

fn network_timeout(config: &Config) -> Result<Duration, KiraError> {
    let timeout = Duration::from_secs(config.network_timeout_secs.unwrap_or(60));
    if timeout.is_zero() {
        return Err(KiraError::InvalidConfig(
            "network_timeout_secs must be positive".to_string(),
        ));
    }
    Ok(timeout)
}

fn resolve_marker_panel(
    panel: BTreeMap<String, Vec<String>>,
) -> Result<Vec<MarkerCategory>, KiraError> {
    panel
        .into_iter()
        .map(|(category, features)| {
            let category = category.trim().to_string();
            if category.is_empty() {
                return Err(KiraError::InvalidConfig(
                    "marker_panel category names must not be empty".to_string(),
                ));
            }
            let features: Vec<String> = features
                .iter()
                .map(|feature| feature.trim().to_string())
                .collect();
            if features.is_empty() || features.iter().any(String::is_empty) {
                return Err(KiraError::InvalidConfig(format!(
                    "marker_panel category {category:?} needs non-empty feature names"
                )));
            }
            Ok(MarkerCategory { category, features })
        })
        .collect()
}

fn resolve_matrix(entry: MatrixEntry) -> Result<MatrixSpec, KiraError> {
    match entry {
        MatrixEntry::Shorthand(value) => {
            let (group, file) = value.split_once('=').ok_or_else(|| {
                KiraError::InvalidConfig(format!("matrix entry {value:?} is not group=file"))
            })?;
            Ok(MatrixSpec {
                group: group.parse()?,
                file: checked_file_name(file)?,
                id_column: None,
                annotation_columns: Vec::new(),
            })
        }
        MatrixEntry::Detailed(obj) => Ok(MatrixSpec {
            group: obj.group.parse()?,
            file: checked_file_name(&obj.file)?,
            id_column: obj.id_column,
            annotation_columns: obj.annotation_columns,
        }),
    }
}

/// Supplementary files live flat in the dataset's raw directory.
fn checked_file_name(file: &str) -> Result<String, KiraError> {
    let file = file.trim();
    if file.is_empty() || file.contains(['/', '\\']) || file.starts_with('.') {
        return Err(KiraError::InvalidConfig(format!(
            "matrix file must be a plain file name, got {file:?}"
        )));
    }
    Ok(file.to_string())
}

fn validate_matrices(matrices: &[MatrixSpec]) -> Result<(), KiraError> {
    if matrices.is_empty() {
        return Err(KiraError::InvalidConfig(
            "at least one matrix must be configured".to_string(),
        ));
    }
    let mut groups = HashSet::new();
    for spec in matrices {
        if !groups.insert(&spec.group) {
            return Err(KiraError::InvalidConfig(format!(
                "group {} is mapped to more than one matrix",
                spec.group
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn base() -> Config {
        Config {
            dataset_id: Some("GSE300437".to_string()),
            target_feature: Some("Polb".to_string()),
            cache_root: Some("/tmp/kira-cx".to_string()),
            matrices: vec![MatrixEntry::Shorthand(
                "tissue=GSE300437_tissue.txt.gz".to_string(),
            )],
            ..Config::default()
        }
    }

    #[test]
    fn parse_config_shorthand() {
        let resolved = ConfigLoader::resolve_config(base(), Overrides::default()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.dataset_id.as_str(), "GSE300437");
        assert_eq!(resolved.matrices.len(), 1);
        assert_eq!(resolved.matrices[0].group.as_str(), "tissue");
        assert_eq!(resolved.matrices[0].file, "GSE300437_tissue.txt.gz");
        assert_eq!(resolved.retry.max_attempts(), 4);
        assert_eq!(resolved.sample_key, SampleKey::Accession);
        assert_eq!(resolved.p_threshold, 0.05);
    }

    #[test]
    fn overrides_win() {
        let overrides = Overrides {
            target_feature: Some("Acta2".to_string()),
            ..Overrides::default()
        };
        let resolved = ConfigLoader::resolve_config(base(), overrides).unwrap();
        assert_eq!(resolved.target_feature, "Acta2");
    }

    #[test]
    fn duplicate_group_is_rejected() {
        let mut config = base();
        config
            .matrices
            .push(MatrixEntry::Shorthand("tissue=other.txt.gz".to_string()));
        assert_matches!(
            ConfigLoader::resolve_config(config, Overrides::default()),
            Err(KiraError::InvalidConfig(message)) if message.contains("more than one")
        );
    }

    #[test]
    fn matrix_file_must_be_plain_name() {
        let mut config = base();
        config.matrices = vec![MatrixEntry::Shorthand("tissue=../x.txt".to_string())];
        assert_matches!(
            ConfigLoader::resolve_config(config, Overrides::default()),
            Err(KiraError::InvalidConfig(_))
        );
    }

    #[test]
    fn detailed_entries_from_json() {
        let json = r#"{
            "dataset_id": "GSE300437",
            "target_feature": "Polb",
            "cache_root": "data",
            "retry_count": 1,
            "retry_backoff_ms": 10,
            "network_timeout_secs": 5,
            "sample_key": "title",
            "group_attribute": "tissue",
            "include_groups": ["liver"],
            "matrices": [
                "in-vitro=GSE300437_hsc.txt.gz",
                {"group": "in-vivo", "file": "GSE300437_liver.txt.gz", "annotation_columns": ["SYMBOL"]}
            ]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let resolved = ConfigLoader::resolve_config(config, Overrides::default()).unwrap();
        assert_eq!(resolved.matrices.len(), 2);
        assert_eq!(resolved.matrices[1].annotation_columns, ["SYMBOL"]);
        assert_eq!(resolved.sample_key, SampleKey::Title);
        assert_eq!(resolved.network_timeout, Duration::from_secs(5));
        assert_eq!(resolved.retry.backoff(1), Duration::from_millis(10));
        assert_eq!(resolved.include_groups[0].as_str(), "liver");
    }

    #[test]
    fn marker_panel_is_resolved_in_category_order() {
        let mut config = base();
        config.marker_panel = BTreeMap::from([
            ("Inflammation".to_string(), vec![" Il6 ".to_string(), "Il1b".to_string()]),
            ("Classic".to_string(), vec!["Acta2".to_string()]),
        ]);
        let resolved = ConfigLoader::resolve_config(config, Overrides::default()).unwrap();
        let categories: Vec<_> = resolved
            .marker_panel
            .iter()
            .map(|c| c.category.as_str())
            .collect();
        assert_eq!(categories, ["Classic", "Inflammation"]);
        assert_eq!(resolved.marker_panel[1].features, ["Il6", "Il1b"]);
        assert!(
            ConfigLoader::resolve_config(base(), Overrides::default())
                .unwrap()
                .marker_panel
                .is_empty()
        );
    }

    #[test]
    fn empty_marker_category_is_rejected() {
        let mut config = base();
        config.marker_panel = BTreeMap::from([("Hedgehog".to_string(), Vec::new())]);
        assert_matches!(
            ConfigLoader::resolve_config(config, Overrides::default()),
            Err(KiraError::InvalidConfig(message)) if message.contains("Hedgehog")
        );
    }

    #[test]
    fn missing_target_is_an_error() {
        let mut config = base();
        config.target_feature = None;
        assert_matches!(
            ConfigLoader::resolve_config(config, Overrides::default()),
            Err(KiraError::InvalidConfig(_))
        );
    }
}
