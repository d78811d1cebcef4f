use std::collections::HashSet;

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::align::AlignedGroup;
use crate::domain::{DatasetId, GroupLabel};
use crate::error::KiraError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRecord {
    pub target_feature: String,
    pub other_feature: String,
    pub group: GroupLabel,
    pub coefficient: f64,
    pub p_value: f64,
    pub n: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pearson {
    pub r: f64,
    pub p_value: f64,
    pub n: usize,
}

/// Pearson correlation over the positions where both values are present.
///
/// Returns `None` with fewer than two complete pairs or when either side is
/// constant over those pairs. The p-value is two-sided from Student's t with
/// `n - 2` degrees of freedom; with exactly two pairs it is 1.
pub fn pearson(x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> Option<Pearson> {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y.iter())
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .collect();
    let n = pairs.len();
    if n < 2 {
        return None;
    }
    let (x0, y0) = pairs[0];
    if pairs.iter().all(|(a, _)| *a == x0) || pairs.iter().all(|(_, b)| *b == y0) {
        return None;
    }

    // r is scale invariant; dividing by the largest magnitude keeps the
    // sums of squares finite for values near f64::MAX.
    let scale_x = pairs.iter().fold(0.0f64, |acc, (a, _)| acc.max(a.abs()));
    let scale_y = pairs.iter().fold(0.0f64, |acc, (_, b)| acc.max(b.abs()));
    let count = n as f64;
    let mean_x = pairs.iter().map(|(a, _)| a / scale_x).sum::<f64>() / count;
    let mean_y = pairs.iter().map(|(_, b)| b / scale_y).sum::<f64>() / count;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for (a, b) in &pairs {
        let dx = a / scale_x - mean_x;
        let dy = b / scale_y - mean_y;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }

    let r = sxy / (sxx.sqrt() * syy.sqrt());
    if !r.is_finite() {
        return None;
    }
    let r = r.clamp(-1.0, 1.0);
    Some(Pearson {
        r,
        p_value: two_sided_p(r, n),
        n,
    })
}

fn two_sided_p(r: f64, n: usize) -> f64 {
    if n <= 2 {
        return 1.0;
    }
    let df = (n - 2) as f64;
    let denom = 1.0 - r * r;
    if denom <= 0.0 {
        return 0.0;
    }
    let t = r * (df / denom).sqrt();
    if t.is_nan() {
        return 1.0;
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => (2.0 * dist.sf(t.abs())).min(1.0),
        Err(_) => 1.0,
    }
}

/// Correlates `target` with every other feature of the group.
///
/// Records follow matrix row order. Pairs with fewer than two complete
/// observations or zero variance are left out.
pub fn correlate(
    dataset_id: &DatasetId,
    group: &AlignedGroup,
    target: &str,
) -> Result<Vec<CorrelationRecord>, KiraError> {
    let target_idx = group
        .feature_index(target)
        .ok_or_else(|| KiraError::FeatureNotFound {
            feature: target.to_string(),
            dataset_id: dataset_id.to_string(),
            group: group.group.to_string(),
        })?;
    let target_row = group.row(target_idx);

    let records = group
        .features
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != target_idx)
        .filter_map(|(idx, feature)| {
            pearson(target_row, group.row(idx)).map(|stat| CorrelationRecord {
                target_feature: target.to_string(),
                other_feature: feature.clone(),
                group: group.group.clone(),
                coefficient: stat.r,
                p_value: stat.p_value,
                n: stat.n,
            })
        })
        .collect();
    Ok(records)
}

/// Features reported together under one name in the marker table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerCategory {
    pub category: String,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub category: String,
    pub record: CorrelationRecord,
}

/// Tags the records of every panel feature with its category.
///
/// Output follows panel order (category, then feature), and group order
/// within a feature. Feature ids match exactly. A feature listed under two
/// categories appears under both.
pub fn marker_records(
    records: &[CorrelationRecord],
    panel: &[MarkerCategory],
) -> Vec<MarkerRecord> {
    let mut tagged = Vec::new();
    for category in panel {
        for feature in &category.features {
            tagged.extend(
                records
                    .iter()
                    .filter(|record| &record.other_feature == feature)
                    .map(|record| MarkerRecord {
                        category: category.category.clone(),
                        record: record.clone(),
                    }),
            );
        }
    }
    tagged
}

/// Panel features with no record in any group, in panel order. The target
/// itself never counts as absent.
pub fn absent_markers(
    records: &[CorrelationRecord],
    panel: &[MarkerCategory],
    target: &str,
) -> Vec<String> {
    let present: HashSet<&str> = records.iter().map(|r| r.other_feature.as_str()).collect();
    let mut absent: Vec<String> = Vec::new();
    for feature in panel.iter().flat_map(|category| &category.features) {
        if feature != target && !present.contains(feature.as_str()) && !absent.contains(feature) {
            absent.push(feature.clone());
        }
    }
    absent
}

/// Records with `p_value < threshold`, most negative coefficient first.
pub fn significant(records: &[CorrelationRecord], threshold: f64) -> Vec<CorrelationRecord> {
    let mut hits: Vec<_> = records
        .iter()
        .filter(|record| record.p_value < threshold)
        .cloned()
        .collect();
    hits.sort_by(|a, b| a.coefficient.total_cmp(&b.coefficient));
    hits
}
