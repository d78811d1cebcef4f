//! SOFT family file parsing.
//!
//! A family file is a sequence of entities, each opened by a `^KIND = id`
//! line and followed by `!Kind_attribute = value` lines. Sample entities may
//! embed a data table between `!sample_table_begin` and `!sample_table_end`;
//! those rows are skipped here.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::{GroupLabel, SampleKey};
use crate::error::KiraError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub accession: String,
    pub title: Option<String>,
    pub group: Option<GroupLabel>,
    pub attributes: BTreeMap<String, String>,
}

impl SampleRecord {
    pub fn key(&self, key: SampleKey) -> Option<&str> {
        match key {
            SampleKey::Accession => Some(self.accession.as_str()),
            SampleKey::Title => self.title.as_deref(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        match name {
            "title" => self.title.as_deref(),
            "accession" | "geo_accession" => Some(self.accession.as_str()),
            _ => self.attributes.get(name).map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub accession: Option<String>,
    pub title: Option<String>,
    pub organism: Option<String>,
    pub supplementary_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyFile {
    pub series: SeriesInfo,
    pub samples: Vec<SampleRecord>,
}

enum Section {
    Preamble,
    Series,
    Sample(SampleRecord),
    Other,
}

/// Parses a decompressed family file.
///
/// `group_attribute` names the sample attribute whose value becomes the
/// record's group label (`title`, `source_name_ch1`, or a characteristic key
/// such as `tissue`).
pub fn parse_family(text: &str, group_attribute: Option<&str>) -> Result<FamilyFile, KiraError> {
    if text.trim().is_empty() {
        return Err(KiraError::Parse("family file is empty".to_string()));
    }

    let mut series = SeriesInfo::default();
    let mut samples = Vec::new();
    let mut seen = HashSet::new();
    let mut section = Section::Preamble;
    let mut in_table = false;

    for (line_no, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches('\r');

        if in_table {
            if line.starts_with("!sample_table_end") || line.starts_with("!platform_table_end")
            {
                in_table = false;
            }
            continue;
        }
        if line.starts_with("!sample_table_begin") || line.starts_with("!platform_table_begin") {
            in_table = true;
            continue;
        }

        if let Some(entity) = line.strip_prefix('^') {
            let (kind, id) = split_assignment(entity).ok_or_else(|| {
                KiraError::Parse(format!("line {}: malformed entity marker", line_no + 1))
            })?;
            let previous = std::mem::replace(
                &mut section,
                match kind.to_ascii_uppercase().as_str() {
                    "SERIES" => {
                        series.accession = Some(id.to_string());
                        Section::Series
                    }
                    "SAMPLE" => {
                        if id.is_empty() {
                            return Err(KiraError::Parse(format!(
                                "line {}: sample marker without accession",
                                line_no + 1
                            )));
                        }
                        if !seen.insert(id.to_string()) {
                            return Err(KiraError::Parse(format!(
                                "duplicate sample accession {id}"
                            )));
                        }
                        Section::Sample(SampleRecord {
                            accession: id.to_string(),
                            title: None,
                            group: None,
                            attributes: BTreeMap::new(),
                        })
                    }
                    _ => Section::Other,
                },
            );
            if let Section::Sample(record) = previous {
                samples.push(record);
            }
            continue;
        }

        let Some(attr) = line.strip_prefix('!') else {
            continue;
        };
        let Some((name, value)) = split_assignment(attr) else {
            continue;
        };

        match &mut section {
            Section::Series => apply_series_attribute(&mut series, name, value),
            Section::Sample(record) => apply_sample_attribute(record, name, value),
            Section::Preamble | Section::Other => {}
        }
    }

    if let Section::Sample(record) = section {
        samples.push(record);
    }

    if samples.is_empty() {
        return Err(KiraError::Parse(
            "no ^SAMPLE records found; not a GEO family file".to_string(),
        ));
    }

    if let Some(attribute) = group_attribute {
        for record in &mut samples {
            record.group = record
                .attribute(attribute)
                .and_then(|value| value.parse().ok());
        }
    }

    Ok(FamilyFile { series, samples })
}

fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once('=')?;
    Some((name.trim(), value.trim()))
}

fn apply_series_attribute(series: &mut SeriesInfo, name: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    match name {
        "Series_title" => series.title = Some(value.to_string()),
        "Series_supplementary_file" => series.supplementary_urls.push(value.to_string()),
        "Series_organism" | "Series_organism_ch1" | "Series_platform_organism"
            if series.organism.is_none() =>
        {
            series.organism = Some(value.to_string());
        }
        _ => {}
    }
}

fn apply_sample_attribute(record: &mut SampleRecord, name: &str, value: &str) {
    let Some(key) = name.strip_prefix("Sample_") else {
        return;
    };
    if value.is_empty() {
        return;
    }
    if key == "title" {
        record.title = Some(value.to_string());
        return;
    }
    if key.starts_with("characteristics_ch") {
        if let Some((char_key, char_value)) = value.split_once(':') {
            let char_key = char_key.trim();
            if !char_key.is_empty() {
                push_attribute(&mut record.attributes, char_key, char_value.trim());
                return;
            }
        }
    }
    push_attribute(&mut record.attributes, key, value);
}

fn push_attribute(attributes: &mut BTreeMap<String, String>, key: &str, value: &str) {
    attributes
        .entry(key.to_string())
        .and_modify(|existing| {
            existing.push_str("; ");
            existing.push_str(value);
        })
        .or_insert_with(|| value.to_string());
}

/// Keeps only the samples whose group is listed. An empty list keeps everything.
pub fn select_groups(samples: &[SampleRecord], include: &[GroupLabel]) -> Vec<SampleRecord> {
    samples
        .iter()
        .filter(|record| {
            include.is_empty()
                || record
                    .group
                    .as_ref()
                    .is_some_and(|group| include.contains(group))
        })
        .cloned()
        .collect()
}

/// Supplementary files that look like expression matrices.
pub fn matrix_candidates(urls: &[String]) -> Vec<String> {
    urls.iter()
        .filter(|url| {
            let lower = url.to_lowercase();
            (lower.contains(".matrix") || lower.contains(".count") || lower.contains(".txt"))
                && !lower.contains("readme")
        })
        .cloned()
        .collect()
}

pub fn file_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}
