use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::Stage;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid dataset id: {0}")]
    InvalidDatasetId(String),

    #[error("not a GEO series accession (expected GSE<digits>): {0}")]
    NotGeoSeries(String),

    #[error("invalid group label: {0}")]
    InvalidGroupLabel(String),

    #[error("missing config file kira-cx.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    #[diagnostic(help("check the `matrices` section of kira-cx.json"))]
    InvalidConfig(String),

    #[error("GEO request failed: {0}")]
    GeoHttp(String),

    #[error("GEO returned status {status}: {message}")]
    GeoStatus { status: u16, message: String },

    #[error("retrieval of {dataset_id} failed after {attempts} attempt(s): {source}")]
    Retrieval {
        dataset_id: String,
        attempts: u32,
        #[source]
        source: Box<KiraError>,
    },

    #[error("supplementary file {file} is not listed for {dataset_id}")]
    #[diagnostic(help("run `kira-cx files <dataset>` to list available matrices"))]
    SupplementaryNotListed { dataset_id: String, file: String },

    #[error("malformed family file: {0}")]
    Parse(String),

    #[error("malformed matrix {file}: {message}")]
    MatrixFormat { file: String, message: String },

    #[error("cannot align {source_file} ({group}): {message}")]
    Alignment {
        group: String,
        source_file: String,
        message: String,
    },

    #[error("feature {feature} not found in {dataset_id} ({group})")]
    #[diagnostic(help("check `target_feature`; matching is exact and case-sensitive"))]
    FeatureNotFound {
        feature: String,
        dataset_id: String,
        group: String,
    },

    #[error("cached artifact {stage} for {dataset_id} is unusable: {message}")]
    CacheCorruption {
        dataset_id: String,
        stage: Stage,
        message: String,
    },

    #[error("stage `{stage}` failed for {dataset_id}")]
    StageFailed {
        dataset_id: String,
        stage: Stage,
        #[source]
        source: Box<KiraError>,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl KiraError {
    /// Transport failures and throttling/server statuses; everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        match self {
            KiraError::GeoHttp(_) => true,
            KiraError::GeoStatus { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    pub fn in_stage(self, dataset_id: &str, stage: Stage) -> KiraError {
        match self {
            already @ KiraError::StageFailed { .. } => already,
            other => KiraError::StageFailed {
                dataset_id: dataset_id.to_string(),
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The error that originated a stage failure.
    pub fn root(&self) -> &KiraError {
        match self {
            KiraError::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }
}
