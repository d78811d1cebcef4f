use std::collections::{HashMap, HashSet};

use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::domain::{GroupLabel, SampleKey};
use crate::error::KiraError;
use crate::matrix::{ExpressionMatrix, dense};
use crate::soft::SampleRecord;

/// A matrix restricted to the columns that have sample metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedGroup {
    pub group: GroupLabel,
    pub source: String,
    pub features: Vec<String>,
    /// Metadata for each retained column, in matrix column order.
    pub samples: Vec<SampleRecord>,
    #[serde(with = "dense")]
    pub values: Array2<f64>,
    pub original_columns: usize,
    pub dropped: Vec<String>,
}

impl AlignedGroup {
    pub fn dropped_count(&self) -> usize {
        self.dropped.len()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn feature_index(&self, feature: &str) -> Option<usize> {
        self.features.iter().position(|candidate| candidate == feature)
    }

    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.row(index)
    }
}

/// Joins a matrix with sample metadata by exact key match.
///
/// Columns without a metadata record are dropped and listed in
/// [`AlignedGroup::dropped`]. Fails when nothing survives or when a column
/// matches a key that several metadata records share. Shared keys that no
/// column uses are ignored.
pub fn align(
    matrix: &ExpressionMatrix,
    samples: &[SampleRecord],
    key: SampleKey,
) -> Result<AlignedGroup, KiraError> {
    let align_err = |message: String| KiraError::Alignment {
        group: matrix.group.to_string(),
        source_file: matrix.source.clone(),
        message,
    };

    let mut by_key: HashMap<&str, &SampleRecord> = HashMap::with_capacity(samples.len());
    let mut shared: HashSet<&str> = HashSet::new();
    for record in samples {
        let Some(value) = record.key(key) else {
            continue;
        };
        if by_key.insert(value, record).is_some() {
            shared.insert(value);
        }
    }

    let mut keep = Vec::new();
    let mut retained = Vec::new();
    let mut dropped = Vec::new();
    for (idx, column) in matrix.samples.iter().enumerate() {
        if shared.contains(column.as_str()) {
            return Err(align_err(format!(
                "metadata {key} {column:?} is shared by several samples"
            )));
        }
        match by_key.get(column.as_str()) {
            Some(record) => {
                keep.push(idx);
                retained.push((*record).clone());
            }
            None => dropped.push(column.clone()),
        }
    }

    if keep.is_empty() {
        return Err(align_err(format!(
            "none of the {} matrix columns match a sample {key}",
            matrix.samples.len()
        )));
    }

    Ok(AlignedGroup {
        group: matrix.group.clone(),
        source: matrix.source.clone(),
        features: matrix.features.clone(),
        samples: retained,
        values: matrix.values.select(Axis(1), &keep),
        original_columns: matrix.samples.len(),
        dropped,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches::assert_matches;
    use ndarray::array;

    use super::*;

    fn record(accession: &str, title: &str) -> SampleRecord {
        SampleRecord {
            accession: accession.to_string(),
            title: Some(title.to_string()),
            group: None,
            attributes: BTreeMap::new(),
        }
    }

    fn matrix(samples: &[&str]) -> ExpressionMatrix {
        ExpressionMatrix {
            group: "tissue".parse().unwrap(),
            source: "m.txt".to_string(),
            features: vec!["GeneA".to_string(), "GeneB".to_string()],
            samples: samples.iter().map(|s| s.to_string()).collect(),
            values: array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
        }
    }

    #[test]
    fn drops_unmatched_columns_and_counts_them() {
        let metadata = vec![record("GSM1", "a"), record("GSM3", "c")];
        let aligned = align(&matrix(&["GSM1", "GSM2", "GSM3"]), &metadata, SampleKey::Accession)
            .unwrap();
        assert_eq!(aligned.dropped, ["GSM2"]);
        assert_eq!(
            aligned.dropped_count(),
            aligned.original_columns - aligned.sample_count()
        );
        assert_eq!(aligned.values, array![[1.0, 3.0], [4.0, 6.0]]);
        assert_eq!(aligned.features, ["GeneA", "GeneB"]);
        let kept: Vec<_> = aligned.samples.iter().map(|s| s.accession.as_str()).collect();
        assert_eq!(kept, ["GSM1", "GSM3"]);
    }

    #[test]
    fn every_retained_column_has_metadata() {
        let metadata = vec![record("GSM3", "c"), record("GSM9", "z"), record("GSM1", "a")];
        let aligned = align(&matrix(&["GSM1", "GSM2", "GSM3"]), &metadata, SampleKey::Accession)
            .unwrap();
        for sample in &aligned.samples {
            assert!(metadata.contains(sample));
        }
    }

    #[test]
    fn matching_is_exact() {
        let metadata = vec![record("gsm1", "a"), record("GSM10", "b")];
        assert_matches!(
            align(&matrix(&["GSM1", "GSM2", "GSM3"]), &metadata, SampleKey::Accession),
            Err(KiraError::Alignment { .. })
        );
    }

    #[test]
    fn empty_intersection_is_fatal() {
        let metadata = vec![record("GSM7", "x")];
        assert_matches!(
            align(&matrix(&["s1", "s2", "s3"]), &metadata, SampleKey::Accession),
            Err(KiraError::Alignment { message, .. }) if message.contains("none of the 3")
        );
    }

    #[test]
    fn can_join_on_title() {
        let metadata = vec![record("GSM1", "s1"), record("GSM2", "s2"), record("GSM3", "s3")];
        let aligned = align(&matrix(&["s1", "s2", "s3"]), &metadata, SampleKey::Title).unwrap();
        assert_eq!(aligned.sample_count(), 3);
        assert_eq!(aligned.samples[1].accession, "GSM2");
    }

    #[test]
    fn ambiguous_titles_are_rejected() {
        let metadata = vec![record("GSM1", "s1"), record("GSM2", "s1")];
        assert_matches!(
            align(&matrix(&["s1", "s2", "s3"]), &metadata, SampleKey::Title),
            Err(KiraError::Alignment { .. })
        );
    }

    #[test]
    fn shared_titles_outside_the_matrix_are_ignored() {
        let metadata = vec![
            record("GSM1", "s1"),
            record("GSM2", "s2"),
            record("GSM3", "s3"),
            record("GSM4", "replicate"),
            record("GSM5", "replicate"),
        ];
        let aligned = align(&matrix(&["s1", "s2", "s3"]), &metadata, SampleKey::Title).unwrap();
        assert_eq!(aligned.sample_count(), 3);
        assert!(aligned.dropped.is_empty());

        let err = align(&matrix(&["s1", "replicate", "s3"]), &metadata, SampleKey::Title)
            .unwrap_err();
        assert_matches!(
            err,
            KiraError::Alignment { message, .. } if message.contains("\"replicate\"")
        );
    }

    #[test]
    fn alignment_is_deterministic() {
        let metadata = vec![record("GSM1", "a"), record("GSM2", "b")];
        let m = matrix(&["GSM2", "GSMx", "GSM1"]);
        assert_eq!(
            align(&m, &metadata, SampleKey::Accession).unwrap(),
            align(&m, &metadata, SampleKey::Accession).unwrap()
        );
    }
}
