use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

use crate::correlation::{CorrelationRecord, MarkerRecord};
use crate::domain::GroupLabel;
use crate::error::KiraError;
use crate::fs_util;

/// Receives the finished correlation table. Rendering lives outside the crate.
pub trait Plotter {
    fn plot(&self, target: &str, groups: &[GroupLabel], records: &[CorrelationRecord]);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlot;

impl Plotter for NoPlot {
    fn plot(&self, _target: &str, _groups: &[GroupLabel], _records: &[CorrelationRecord]) {}
}

#[derive(Serialize)]
struct TableRow<'a> {
    other_feature_id: &'a str,
    group_label: &'a str,
    coefficient: f64,
    p_value: f64,
    n: usize,
}

impl<'a> From<&'a CorrelationRecord> for TableRow<'a> {
    fn from(record: &'a CorrelationRecord) -> Self {
        Self {
            other_feature_id: &record.other_feature,
            group_label: record.group.as_str(),
            coefficient: record.coefficient,
            p_value: record.p_value,
            n: record.n,
        }
    }
}

#[derive(Serialize)]
struct MarkerRow<'a> {
    category: &'a str,
    other_feature_id: &'a str,
    group_label: &'a str,
    coefficient: f64,
    p_value: f64,
    n: usize,
}

impl<'a> From<&'a MarkerRecord> for MarkerRow<'a> {
    fn from(marker: &'a MarkerRecord) -> Self {
        let row = TableRow::from(&marker.record);
        Self {
            category: &marker.category,
            other_feature_id: row.other_feature_id,
            group_label: row.group_label,
            coefficient: row.coefficient,
            p_value: row.p_value,
            n: row.n,
        }
    }
}

const COLUMNS: [&str; 5] = ["other_feature_id", "group_label", "coefficient", "p_value", "n"];

// Header goes out even when there are no rows.
fn render<R: Serialize>(
    header: &[&str],
    rows: impl IntoIterator<Item = R>,
) -> Result<Vec<u8>, KiraError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(header)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|err| KiraError::Filesystem(err.to_string()))
}

pub fn render_table(records: &[CorrelationRecord]) -> Result<Vec<u8>, KiraError> {
    render(&COLUMNS, records.iter().map(TableRow::from))
}

/// Like [`render_table`] with a leading `category` column.
pub fn render_marker_table(markers: &[MarkerRecord]) -> Result<Vec<u8>, KiraError> {
    let header: Vec<&str> = std::iter::once("category").chain(COLUMNS).collect();
    render(&header, markers.iter().map(MarkerRow::from))
}

pub fn write_table(path: &Path, records: &[CorrelationRecord]) -> Result<(), KiraError> {
    let bytes = render_table(records)?;
    fs_util::write_atomic(path, &bytes)
}

pub fn write_marker_table(path: &Path, markers: &[MarkerRecord]) -> Result<(), KiraError> {
    let bytes = render_marker_table(markers)?;
    fs_util::write_atomic(path, &bytes)
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
