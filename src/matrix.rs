use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::GroupLabel;
use crate::error::KiraError;

const MISSING_TOKENS: [&str; 6] = ["", "NA", "NaN", "nan", "null", "NULL"];

/// Dense feature × sample table. Missing cells are stored as NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionMatrix {
    pub group: GroupLabel,
    pub source: String,
    pub features: Vec<String>,
    pub samples: Vec<String>,
    #[serde(with = "dense")]
    pub values: Array2<f64>,
}

impl ExpressionMatrix {
    pub fn feature_index(&self, feature: &str) -> Option<usize> {
        self.features.iter().position(|candidate| candidate == feature)
    }

    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.row(index)
    }
}

/// How to read one supplementary matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixSpec {
    pub group: GroupLabel,
    pub file: String,
    /// Header of the feature id column; the first column when unset.
    #[serde(default)]
    pub id_column: Option<String>,
    /// Non-sample columns (gene symbols, descriptions) to ignore.
    #[serde(default)]
    pub annotation_columns: Vec<String>,
}

pub fn load_matrix(path: &Path, spec: &MatrixSpec) -> Result<ExpressionMatrix, KiraError> {
    let format_err = |message: String| KiraError::MatrixFormat {
        file: spec.file.clone(),
        message,
    };

    let reader = open_maybe_gzip(path).map_err(|err| format_err(err.to_string()))?;
    let mut csv = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(false)
        .from_reader(reader);

    let headers = csv
        .headers()
        .map_err(|err| format_err(err.to_string()))?
        .clone();
    let id_pos = match &spec.id_column {
        Some(name) => headers
            .iter()
            .position(|header| header.trim() == name)
            .ok_or_else(|| format_err(format!("id column {name} not found in header")))?,
        None => 0,
    };

    let mut sample_positions = Vec::new();
    let mut samples = Vec::new();
    let mut seen_samples = HashSet::new();
    for (pos, header) in headers.iter().enumerate() {
        let header = header.trim();
        if pos == id_pos || spec.annotation_columns.iter().any(|col| col == header) {
            continue;
        }
        if !seen_samples.insert(header.to_string()) {
            return Err(format_err(format!("duplicate sample column {header}")));
        }
        sample_positions.push(pos);
        samples.push(header.to_string());
    }
    if samples.is_empty() {
        return Err(format_err("no sample columns".to_string()));
    }

    let mut features = Vec::new();
    let mut seen_features = HashSet::new();
    let mut data = Vec::new();
    for (row_idx, record) in csv.records().enumerate() {
        let record = record.map_err(|err| format_err(err.to_string()))?;
        let line = row_idx + 2;
        let feature = record.get(id_pos).map(str::trim).unwrap_or_default();
        if feature.is_empty() {
            return Err(format_err(format!("line {line}: empty feature id")));
        }
        if !seen_features.insert(feature.to_string()) {
            return Err(format_err(format!("line {line}: duplicate feature id {feature}")));
        }
        for (&pos, sample) in sample_positions.iter().zip(&samples) {
            let cell = record.get(pos).map(str::trim).unwrap_or_default();
            let value = parse_cell(cell).ok_or_else(|| {
                format_err(format!(
                    "line {line}, column {sample}: non-numeric value {cell:?}"
                ))
            })?;
            data.push(value);
        }
        features.push(feature.to_string());
    }
    if features.is_empty() {
        return Err(format_err("no feature rows".to_string()));
    }

    let values = Array2::from_shape_vec((features.len(), samples.len()), data)
        .map_err(|err| format_err(err.to_string()))?;

    Ok(ExpressionMatrix {
        group: spec.group.clone(),
        source: spec.file.clone(),
        features,
        samples,
        values,
    })
}

/// Loads every matrix on the rayon pool; output order follows `inputs`.
pub fn load_all<P>(inputs: &[(P, MatrixSpec)]) -> Result<Vec<ExpressionMatrix>, KiraError>
where
    P: AsRef<Path> + Sync,
{
    inputs
        .par_iter()
        .map(|(path, spec)| {
            tracing::debug!(file = spec.file.as_str(), group = spec.group.as_str(), "loading matrix");
            load_matrix(path.as_ref(), spec)
        })
        .collect()
}

fn parse_cell(cell: &str) -> Option<f64> {
    if MISSING_TOKENS.contains(&cell) {
        return Some(f64::NAN);
    }
    cell.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn open_maybe_gzip(path: &Path) -> std::io::Result<Box<dyn Read>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let is_gzip = reader.fill_buf()?.starts_with(&[0x1f, 0x8b]);
    if is_gzip {
        Ok(Box::new(MultiGzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Serializes `Array2<f64>` with NaN cells as `null`.
pub(crate) mod dense {
    use ndarray::Array2;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Dense {
        rows: usize,
        cols: usize,
        data: Vec<Option<f64>>,
    }

    pub fn serialize<S: Serializer>(values: &Array2<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        let (rows, cols) = values.dim();
        Dense {
            rows,
            cols,
            data: values
                .iter()
                .map(|value| (!value.is_nan()).then_some(*value))
                .collect(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Array2<f64>, D::Error> {
        let dense = Dense::deserialize(deserializer)?;
        let data = dense
            .data
            .into_iter()
            .map(|value| value.unwrap_or(f64::NAN))
            .collect();
        Array2::from_shape_vec((dense.rows, dense.cols), data).map_err(D::Error::custom)
    }
}
