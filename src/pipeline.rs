use std::time::Instant;

use camino::Utf8PathBuf;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::align::{AlignedGroup, align};
use crate::config::ResolvedConfig;
use crate::correlation::{
    CorrelationRecord, MarkerRecord, absent_markers, correlate, marker_records, significant,
};
use crate::domain::{DatasetId, GroupLabel, Stage};
use crate::error::KiraError;
use crate::events::{EventKind, EventSink, PipelineEvent, millis};
use crate::fs_util;
use crate::geo::{FetchManifest, Fetcher, GeoClient};
use crate::matrix::{ExpressionMatrix, MatrixSpec, load_all};
use crate::output::{self, Plotter};
use crate::soft::{self, SampleRecord, SeriesInfo};
use crate::store::{ArtifactStore, CacheKey, Lookup, Store, load_artifact, save_artifact};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Recompute load, align and correlate even when cached.
    pub force: bool,
    /// Also download raw files again.
    pub refetch: bool,
}

/// Output of the load stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedDataset {
    pub series: SeriesInfo,
    pub samples: Vec<SampleRecord>,
    pub matrices: Vec<ExpressionMatrix>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group: GroupLabel,
    pub source: String,
    pub features: usize,
    pub aligned_samples: usize,
    pub dropped_samples: usize,
}

/// Output of the correlate stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationSet {
    pub target_feature: String,
    pub groups: Vec<GroupSummary>,
    pub records: Vec<CorrelationRecord>,
    /// Panel features tagged with their category; empty without a panel.
    #[serde(default)]
    pub markers: Vec<MarkerRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Cached,
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub dataset_id: DatasetId,
    pub target_feature: String,
    pub groups: Vec<GroupSummary>,
    pub records: usize,
    pub significant: usize,
    pub correlation_table: Utf8PathBuf,
    pub significant_table: Utf8PathBuf,
    pub markers: usize,
    /// Written only when a marker panel is configured.
    pub marker_table: Option<Utf8PathBuf>,
    /// In completion order; stages satisfied by a downstream cache hit are absent.
    pub stages: Vec<StageOutcome>,
}

struct RunContext<'a> {
    options: RunOptions,
    events: &'a dyn EventSink,
    stages: Vec<StageOutcome>,
}

/// Fingerprints of each stage's inputs. Each one embeds its upstream
/// fingerprint so a configuration change invalidates everything after it.
struct Fingerprints {
    fetch: String,
    load: String,
    align: String,
    correlate: String,
}

impl Fingerprints {
    fn new(config: &ResolvedConfig) -> Self {
        let files: Vec<&str> = config.matrices.iter().map(|spec| spec.file.as_str()).collect();
        let fetch = format!("files={}", files.join(","));
        let specs: Vec<String> = config.matrices.iter().map(spec_fingerprint).collect();
        let load = format!(
            "{fetch};group_attribute={};matrices={}",
            config.group_attribute.as_deref().unwrap_or("-"),
            specs.join("|")
        );
        let include: Vec<&str> = config
            .include_groups
            .iter()
            .map(GroupLabel::as_str)
            .collect();
        let align = format!(
            "{load};sample_key={};include={}",
            config.sample_key,
            include.join(",")
        );
        let panel: Vec<String> = config
            .marker_panel
            .iter()
            .map(|c| format!("{}:{}", c.category, c.features.join("+")))
            .collect();
        let correlate = format!(
            "{align};target={};markers={}",
            config.target_feature,
            panel.join("|")
        );
        Self {
            fetch,
            load,
            align,
            correlate,
        }
    }

    fn get(&self, stage: Stage) -> &str {
        match stage {
            Stage::Fetch => &self.fetch,
            Stage::Load => &self.load,
            Stage::Align => &self.align,
            Stage::Correlate => &self.correlate,
        }
    }
}

fn spec_fingerprint(spec: &MatrixSpec) -> String {
    format!(
        "{}={}:{}:{}",
        spec.group,
        spec.file,
        spec.id_column.as_deref().unwrap_or("-"),
        spec.annotation_columns.join("+")
    )
}

/// Sequences fetch → load → align → correlate for one dataset, reusing
/// cached stage artifacts where their inputs are unchanged.
pub struct Pipeline<G: GeoClient, S: ArtifactStore> {
    config: ResolvedConfig,
    store: Store,
    artifacts: S,
    geo: G,
    fingerprints: Fingerprints,
}

impl<G: GeoClient, S: ArtifactStore> Pipeline<G, S> {
    pub fn new(config: ResolvedConfig, store: Store, artifacts: S, geo: G) -> Self {
        let fingerprints = Fingerprints::new(&config);
        Self {
            config,
            store,
            artifacts,
            geo,
            fingerprints,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn artifacts(&self) -> &S {
        &self.artifacts
    }

    pub fn geo(&self) -> &G {
        &self.geo
    }

    pub fn run(
        &self,
        options: RunOptions,
        events: &dyn EventSink,
        plotter: &dyn Plotter,
    ) -> Result<RunReport, KiraError> {
        let mut ctx = RunContext {
            options,
            events,
            stages: Vec::new(),
        };
        let result = self
            .correlated(&mut ctx)
            .and_then(|set| self.finish(set, &mut ctx, plotter));
        match &result {
            Ok(report) => self.emit(
                events,
                EventKind::RunSucceeded {
                    records: report.records,
                },
            ),
            Err(err) => {
                let stage = match err {
                    KiraError::StageFailed { stage, .. } => Some(*stage),
                    _ => None,
                };
                self.emit(
                    events,
                    EventKind::RunFailed {
                        stage,
                        cause: err.root().to_string(),
                    },
                );
            }
        }
        result
    }

    fn finish(
        &self,
        set: CorrelationSet,
        ctx: &mut RunContext<'_>,
        plotter: &dyn Plotter,
    ) -> Result<RunReport, KiraError> {
        let id = &self.config.dataset_id;
        let correlation_table = self.store.correlation_table_path(id);
        let significant_table = self.store.significant_table_path(id);
        let hits = significant(&set.records, self.config.p_threshold);

        let marker_table =
            (!self.config.marker_panel.is_empty()).then(|| self.store.marker_table_path(id));

        output::write_table(correlation_table.as_std_path(), &set.records)
            .and_then(|_| output::write_table(significant_table.as_std_path(), &hits))
            .and_then(|_| match &marker_table {
                Some(path) => output::write_marker_table(path.as_std_path(), &set.markers),
                None => Ok(()),
            })
            .map_err(|err| err.in_stage(id.as_str(), Stage::Correlate))?;

        let labels: Vec<GroupLabel> = set.groups.iter().map(|g| g.group.clone()).collect();
        plotter.plot(&set.target_feature, &labels, &set.records);

        Ok(RunReport {
            dataset_id: id.clone(),
            target_feature: set.target_feature,
            groups: set.groups,
            records: set.records.len(),
            significant: hits.len(),
            correlation_table,
            significant_table,
            markers: set.markers.len(),
            marker_table,
            stages: std::mem::take(&mut ctx.stages),
        })
    }

    fn correlated(&self, ctx: &mut RunContext<'_>) -> Result<CorrelationSet, KiraError> {
        self.resolve(ctx, Stage::Correlate, |_| true, |ctx| {
            let groups = self.aligned(ctx)?;
            let target = &self.config.target_feature;
            let mut records = Vec::new();
            for group in &groups {
                records.extend(correlate(&self.config.dataset_id, group, target)?);
            }
            let panel = &self.config.marker_panel;
            let absent = absent_markers(&records, panel, target);
            if !absent.is_empty() {
                self.emit(ctx.events, EventKind::MarkersAbsent { features: absent });
            }
            Ok(CorrelationSet {
                target_feature: target.clone(),
                groups: groups.iter().map(summarize).collect(),
                markers: marker_records(&records, panel),
                records,
            })
        })
    }

    fn aligned(&self, ctx: &mut RunContext<'_>) -> Result<Vec<AlignedGroup>, KiraError> {
        self.resolve(ctx, Stage::Align, |_| true, |ctx| {
            let loaded = self.loaded(ctx)?;
            let samples = soft::select_groups(&loaded.samples, &self.config.include_groups);
            let mut groups = Vec::with_capacity(loaded.matrices.len());
            for matrix in &loaded.matrices {
                let group = align(matrix, &samples, self.config.sample_key)?;
                if group.dropped_count() > 0 {
                    self.emit(
                        ctx.events,
                        EventKind::AlignmentDropped {
                            group: group.group.clone(),
                            dropped: group.dropped_count(),
                            retained: group.sample_count(),
                        },
                    );
                }
                groups.push(group);
            }
            Ok(groups)
        })
    }

    fn loaded(&self, ctx: &mut RunContext<'_>) -> Result<LoadedDataset, KiraError> {
        self.resolve(ctx, Stage::Load, |_| true, |ctx| {
            let manifest = self.fetched(ctx)?;
            let id = &self.config.dataset_id;
            let family_path = self.store.raw_path(id, &manifest.family_file);
            let text = fs_util::read_text(family_path.as_std_path())?;
            let family = soft::parse_family(&text, self.config.group_attribute.as_deref())?;

            let inputs: Vec<(Utf8PathBuf, MatrixSpec)> = self
                .config
                .matrices
                .iter()
                .map(|spec| (self.store.raw_path(id, &spec.file), spec.clone()))
                .collect();
            let matrices = load_all(&inputs)?;

            Ok(LoadedDataset {
                series: family.series,
                samples: family.samples,
                matrices,
            })
        })
    }

    fn fetched(&self, ctx: &mut RunContext<'_>) -> Result<FetchManifest, KiraError> {
        let usable = |manifest: &FetchManifest| {
            manifest.files().all(|file| {
                let path = self.store.raw_path(&self.config.dataset_id, file);
                fs_util::passes_integrity_check(path.as_std_path())
            })
        };
        self.resolve(ctx, Stage::Fetch, usable, |ctx| {
            let fetcher = Fetcher::new(&self.geo, &self.store, self.config.retry, ctx.events);
            fetcher.fetch(
                &self.config.dataset_id,
                &self.config.matrices,
                ctx.options.refetch,
            )
        })
    }

    /// Returns the cached artifact for `stage` when it is present, decodes,
    /// matches the current fingerprint and passes `usable`; otherwise runs
    /// `compute` and persists its result.
    fn resolve<T, U, F>(
        &self,
        ctx: &mut RunContext<'_>,
        stage: Stage,
        usable: U,
        compute: F,
    ) -> Result<T, KiraError>
    where
        T: Serialize + DeserializeOwned,
        U: Fn(&T) -> bool,
        F: FnOnce(&mut RunContext<'_>) -> Result<T, KiraError>,
    {
        let id = &self.config.dataset_id;
        let key = CacheKey::new(id, stage);
        let fingerprint = self.fingerprints.get(stage);
        let events = ctx.events;

        let bypass = match stage {
            Stage::Fetch => ctx.options.refetch,
            _ => ctx.options.force || ctx.options.refetch,
        };
        if !bypass {
            let lookup = load_artifact::<T>(&self.artifacts, &key, fingerprint)
                .map_err(|err| err.in_stage(id.as_str(), stage))?;
            match lookup {
                Lookup::Hit(value) if usable(&value) => {
                    self.emit(events, EventKind::CacheHit { stage });
                    ctx.stages.push(StageOutcome {
                        stage,
                        status: StageStatus::Cached,
                    });
                    return Ok(value);
                }
                Lookup::Hit(_) => self.emit(
                    events,
                    EventKind::CacheInvalid {
                        stage,
                        reason: "referenced raw files are missing or damaged".to_string(),
                    },
                ),
                Lookup::Miss => self.emit(events, EventKind::CacheMiss { stage }),
                Lookup::Invalid(err) => {
                    self.emit(
                        events,
                        EventKind::CacheInvalid {
                            stage,
                            reason: err.to_string(),
                        },
                    );
                    self.artifacts
                        .remove(&key)
                        .map_err(|err| err.in_stage(id.as_str(), stage))?;
                }
            }
        }

        let start = Instant::now();
        let value = compute(ctx).map_err(|err| err.in_stage(id.as_str(), stage))?;
        save_artifact(&self.artifacts, &key, fingerprint, &value)
            .map_err(|err| err.in_stage(id.as_str(), stage))?;
        self.emit(
            events,
            EventKind::StageCompleted {
                stage,
                elapsed_ms: millis(start.elapsed()),
            },
        );
        ctx.stages.push(StageOutcome {
            stage,
            status: StageStatus::Computed,
        });
        Ok(value)
    }

    fn emit(&self, events: &dyn EventSink, kind: EventKind) {
        events.emit(PipelineEvent::new(self.config.dataset_id.as_str(), kind));
    }
}

fn summarize(group: &AlignedGroup) -> GroupSummary {
    GroupSummary {
        group: group.group.clone(),
        source: group.source.clone(),
        features: group.features.len(),
        aligned_samples: group.sample_count(),
        dropped_samples: group.dropped_count(),
    }
}
