use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::domain::{DatasetId, GroupLabel};
use crate::error::KiraError;
use crate::events::{EventKind, EventSink, PipelineEvent, millis};
use crate::fs_util;
use crate::matrix::MatrixSpec;
use crate::retry::RetryPolicy;
use crate::soft;
use crate::store::Store;

pub trait GeoClient: Send + Sync {
    /// Streams `url` into `destination`, which the caller owns.
    fn download_url(&self, url: &str, destination: &Path) -> Result<u64, KiraError>;
}

#[derive(Clone)]
pub struct GeoHttpClient {
    client: Client,
}

impl GeoHttpClient {
    pub fn new(timeout: Duration) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-cx/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| KiraError::GeoHttp(err.to_string()))?;
        Ok(Self { client })
    }
}

impl GeoClient for GeoHttpClient {
    fn download_url(&self, url: &str, destination: &Path) -> Result<u64, KiraError> {
        let url = normalize_url(url);
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| KiraError::GeoHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "GEO request failed".to_string());
            return Err(KiraError::GeoStatus { status, message });
        }
        let mut file =
            File::create(destination).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        // A body cut short by the timeout surfaces here and is worth retrying.
        std::io::copy(&mut response, &mut file).map_err(|err| KiraError::GeoHttp(err.to_string()))
    }
}

pub fn normalize_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("ftp://ftp.ncbi.nlm.nih.gov/") {
        return format!("https://ftp.ncbi.nlm.nih.gov/{}", rest);
    }
    url.to_string()
}

pub fn geo_series_prefix(accession: &DatasetId) -> String {
    let digits = accession.as_str().trim_start_matches("GSE");
    if digits.len() <= 3 {
        return "GSEnnn".to_string();
    }
    let head = &digits[..digits.len() - 3];
    format!("GSE{}nnn", head)
}

pub fn family_file_name(accession: &DatasetId) -> String {
    format!("{}_family.soft.gz", accession.as_str())
}

pub fn family_url(accession: &DatasetId) -> Result<String, KiraError> {
    if !accession.is_geo_series() {
        return Err(KiraError::NotGeoSeries(accession.to_string()));
    }
    let prefix = geo_series_prefix(accession);
    Ok(format!(
        "https://ftp.ncbi.nlm.nih.gov/geo/series/{prefix}/{acc}/soft/{file}",
        acc = accession.as_str(),
        file = family_file_name(accession)
    ))
}

/// Local files backing one dataset, relative to its raw directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchManifest {
    pub family_file: String,
    pub matrices: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub group: GroupLabel,
    pub file: String,
    pub bytes: u64,
}

impl FetchManifest {
    pub fn files(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.family_file.as_str())
            .chain(self.matrices.iter().map(|entry| entry.file.as_str()))
    }
}

/// Ensures the family file and configured supplementary matrices are on disk.
pub struct Fetcher<'a, G: GeoClient> {
    client: &'a G,
    store: &'a Store,
    policy: RetryPolicy,
    events: &'a dyn EventSink,
}

impl<'a, G: GeoClient> Fetcher<'a, G> {
    pub fn new(
        client: &'a G,
        store: &'a Store,
        policy: RetryPolicy,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            client,
            store,
            policy,
            events,
        }
    }

    pub fn fetch(
        &self,
        dataset: &DatasetId,
        matrices: &[MatrixSpec],
        refetch: bool,
    ) -> Result<FetchManifest, KiraError> {
        self.store.ensure_dataset_dirs(dataset)?;
        let family_file = self.ensure_family(dataset, refetch)?;
        let family_path = self.store.raw_path(dataset, &family_file);

        let mut listed: Option<Vec<String>> = None;
        let mut entries = Vec::with_capacity(matrices.len());
        for spec in matrices {
            let local = self.store.raw_path(dataset, &spec.file);
            if refetch || !fs_util::passes_integrity_check(local.as_std_path()) {
                if listed.is_none() {
                    let text = fs_util::read_text(family_path.as_std_path())?;
                    listed = Some(soft::parse_family(&text, None)?.series.supplementary_urls);
                }
                let url = listed
                    .iter()
                    .flatten()
                    .find(|url| soft::file_name(url) == spec.file)
                    .ok_or_else(|| KiraError::SupplementaryNotListed {
                        dataset_id: dataset.to_string(),
                        file: spec.file.clone(),
                    })?;
                self.download(dataset, url, &local, refetch)?;
            } else {
                self.skipped(dataset, &spec.file);
            }
            entries.push(ManifestEntry {
                group: spec.group.clone(),
                file: spec.file.clone(),
                bytes: file_len(&local),
            });
        }

        Ok(FetchManifest {
            family_file,
            matrices: entries,
        })
    }

    /// Downloads (or reuses) the family file and returns its file name.
    pub fn ensure_family(&self, dataset: &DatasetId, refetch: bool) -> Result<String, KiraError> {
        let name = family_file_name(dataset);
        let local = self.store.raw_path(dataset, &name);
        if !refetch && fs_util::passes_integrity_check(local.as_std_path()) {
            self.skipped(dataset, &name);
            return Ok(name);
        }
        let url = family_url(dataset)?;
        self.download(dataset, &url, &local, refetch)?;
        Ok(name)
    }

    /// Supplementary file URLs listed in the family file.
    pub fn supplementary_urls(&self, dataset: &DatasetId) -> Result<Vec<String>, KiraError> {
        self.store.ensure_dataset_dirs(dataset)?;
        let name = self.ensure_family(dataset, false)?;
        let text = fs_util::read_text(self.store.raw_path(dataset, &name).as_std_path())?;
        Ok(soft::parse_family(&text, None)?.series.supplementary_urls)
    }

    fn download(
        &self,
        dataset: &DatasetId,
        url: &str,
        destination: &Utf8PathBuf,
        replace_valid: bool,
    ) -> Result<(), KiraError> {
        let file = destination.file_name().unwrap_or(destination.as_str()).to_string();
        let parent = destination
            .parent()
            .ok_or_else(|| KiraError::Filesystem("invalid destination path".to_string()))?;
        self.emit(dataset, EventKind::RetrievalStarted { file: file.clone() });

        let start = Instant::now();
        let attempt = || -> Result<(u64, tempfile::NamedTempFile), KiraError> {
            let temp = tempfile::Builder::new()
                .prefix(".kira-cx-download")
                .tempfile_in(parent.as_std_path())
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let bytes = self.client.download_url(url, temp.path())?;
            fs_util::validate_download(temp.path()).map_err(|err| {
                KiraError::GeoHttp(format!("downloaded file failed verification: {err}"))
            })?;
            Ok((bytes, temp))
        };
        let on_retry = |retry: u32, delay: Duration, err: &KiraError| {
            self.emit(
                dataset,
                EventKind::RetrievalRetry {
                    file: file.clone(),
                    retry,
                    delay_ms: millis(delay),
                    cause: err.to_string(),
                },
            );
        };

        let (bytes, temp) = match self.policy.run(attempt, on_retry) {
            Ok(done) => done,
            Err((cause, attempts)) => {
                self.emit(
                    dataset,
                    EventKind::RetrievalFailed {
                        file: file.clone(),
                        cause: cause.to_string(),
                    },
                );
                return Err(KiraError::Retrieval {
                    dataset_id: dataset.to_string(),
                    attempts,
                    source: Box::new(cause),
                });
            }
        };

        // Another writer may have completed the file meanwhile; keep theirs.
        if !replace_valid && fs_util::passes_integrity_check(destination.as_std_path()) {
            self.skipped(dataset, &file);
            return Ok(());
        }
        temp.persist(destination.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        self.emit(
            dataset,
            EventKind::RetrievalFinished {
                file,
                bytes,
                latency_ms: millis(start.elapsed()),
            },
        );
        Ok(())
    }

    fn skipped(&self, dataset: &DatasetId, file: &str) {
        self.emit(
            dataset,
            EventKind::RetrievalSkipped {
                file: file.to_string(),
            },
        );
    }

    fn emit(&self, dataset: &DatasetId, kind: EventKind) {
        self.events.emit(PipelineEvent::new(dataset.as_str(), kind));
    }
}

fn file_len(path: &Utf8PathBuf) -> u64 {
    std::fs::metadata(path.as_std_path())
        .map(|meta| meta.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_prefix() {
        let short: DatasetId = "GSE100".parse().unwrap();
        let long: DatasetId = "GSE300437".parse().unwrap();
        assert_eq!(geo_series_prefix(&short), "GSEnnn");
        assert_eq!(geo_series_prefix(&long), "GSE300nnn");
    }

    #[test]
    fn family_url_layout() {
        let id: DatasetId = "GSE300437".parse().unwrap();
        assert_eq!(
            family_url(&id).unwrap(),
            "https://ftp.ncbi.nlm.nih.gov/geo/series/GSE300nnn/GSE300437/soft/GSE300437_family.soft.gz"
        );
    }

    #[test]
    fn family_url_requires_series_accession() {
        let id: DatasetId = "GSE_TEST".parse().unwrap();
        assert!(matches!(family_url(&id), Err(KiraError::NotGeoSeries(_))));
    }

    #[test]
    fn ftp_urls_become_https() {
        assert_eq!(
            normalize_url("ftp://ftp.ncbi.nlm.nih.gov/geo/series/GSEnnn/GSE1/suppl/a.txt.gz"),
            "https://ftp.ncbi.nlm.nih.gov/geo/series/GSEnnn/GSE1/suppl/a.txt.gz"
        );
    }
}
