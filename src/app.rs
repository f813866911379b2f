use std::collections::{HashMap, HashSet};
use std::fs;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Credentials, RunConfig, Settings};
use crate::domain::{BundleOrigin, Identifier, IdentifierState, TaxonOid};
use crate::downloader::{DownloadRequest, DownloadTask, Downloader};
use crate::error::PortalError;
use crate::listing::{ListingDocument, Location, locate};
use crate::portal::PortalClient;
use crate::resolver::MetadataResolver;
use crate::session::{SessionAuthenticator, SessionToken};
use crate::shard::{Shard, partition, run_sharded};
use crate::store::{OutputLayout, write_bytes_atomic};
use crate::transform::{ArchiveTransformer, TransformOutcome};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifierReport {
    pub oid: String,
    pub project: Option<String>,
    pub state: IdentifierState,
    pub listing: Option<String>,
    pub artifact: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StagePlan {
    pub stage: String,
    pub shards: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub tool: String,
    pub started_at: String,
    pub finished_at: String,
    pub dry_run: bool,
    pub stages: Vec<StagePlan>,
    pub identifiers: Vec<IdentifierReport>,
}

impl RunReport {
    pub fn count(&self, state: IdentifierState) -> usize {
        self.identifiers
            .iter()
            .filter(|entry| entry.state == state)
            .count()
    }

    pub fn failures(&self) -> usize {
        self.identifiers
            .iter()
            .filter(|entry| entry.state.is_failure())
            .count()
    }

    pub fn get(&self, oid: &str) -> Option<&IdentifierReport> {
        self.identifiers.iter().find(|entry| entry.oid == oid)
    }
}

/// Per-identifier bookkeeping in input order. Only the orchestrator thread
/// touches it, between barriers.
struct Ledger {
    entries: Vec<IdentifierReport>,
    index: HashMap<TaxonOid, usize>,
}

impl Ledger {
    fn new(identifiers: &[Identifier]) -> Self {
        let mut entries = Vec::with_capacity(identifiers.len());
        let mut index = HashMap::new();
        for identifier in identifiers {
            index.insert(identifier.oid.clone(), entries.len());
            entries.push(IdentifierReport {
                oid: identifier.oid.to_string(),
                project: identifier.project.as_ref().map(ToString::to_string),
                state: IdentifierState::Unresolved,
                listing: None,
                artifact: None,
                message: None,
            });
        }
        Self { entries, index }
    }

    fn entry(&mut self, oid: &TaxonOid) -> Option<&mut IdentifierReport> {
        let position = *self.index.get(oid)?;
        self.entries.get_mut(position)
    }

    fn set(&mut self, oid: &TaxonOid, state: IdentifierState, message: Option<String>) {
        if let Some(entry) = self.entry(oid) {
            entry.state = state;
            if message.is_some() {
                entry.message = message;
            }
        }
    }

    fn state(&self, oid: &TaxonOid) -> Option<IdentifierState> {
        self.index.get(oid).map(|position| self.entries[*position].state)
    }
}

struct TaskOutcome {
    oid: TaxonOid,
    state: IdentifierState,
    artifact: Option<Utf8PathBuf>,
    message: Option<String>,
}

/// Runs the barrier-gated stage graph: bootstrap, sign-on, sharded resolution,
/// sharded download and transform, optional project pass, teardown.
pub struct App<P: PortalClient> {
    portal: P,
    settings: Settings,
}

impl<P: PortalClient> App<P> {
    pub fn new(portal: P, settings: Settings) -> Self {
        Self { portal, settings }
    }

    pub fn portal(&self) -> &P {
        &self.portal
    }

    pub fn run(
        &self,
        config: &RunConfig,
        credentials: &Credentials,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, PortalError> {
        config.validate()?;
        let started_at = iso_timestamp();
        let identifiers = dedupe(&config.identifiers);
        let mut layout = OutputLayout::new(config.dest_dir.clone(), config.tmp_dir.as_deref());
        if let Some(dir) = &config.listing_dir {
            layout = layout.with_listing_root(dir.clone());
        }
        let mut ledger = Ledger::new(&identifiers);
        let mut stages = Vec::new();

        if config.dry_run {
            self.plan(config, &layout, &identifiers, &mut ledger, &mut stages, sink);
            return Ok(RunReport {
                tool: tool_name(),
                started_at,
                finished_at: iso_timestamp(),
                dry_run: true,
                stages,
                identifiers: ledger.entries,
            });
        }

        emit(sink, "phase=Bootstrap; preparing output directories", None);
        layout.bootstrap(config.shrink)?;

        emit(sink, "phase=Authenticate; signing on", None);
        let session = SessionAuthenticator::new(
            &self.portal,
            &self.settings.endpoints.signon,
            self.settings.cookie_domain(),
        )
        .authenticate(credentials)?;

        let endpoints = &self.settings.endpoints;
        let resolver = MetadataResolver::new(
            &self.portal,
            endpoints,
            &layout,
            config.project_field.is_some(),
        );

        let resolve = config.listing_dir.is_none() && !config.direct;
        if resolve {
            let start = Instant::now();
            self.resolve_stage(
                config,
                &layout,
                &resolver,
                &session,
                &identifiers,
                &mut ledger,
                &mut stages,
            );
            emit(sink, "phase=Resolve; all shards finished", Some(start.elapsed()));
        }

        if config.download {
            let downloader = Downloader::new(&self.portal, endpoints, &layout, &resolver);
            let transformer = ArchiveTransformer::new(&layout, config.exclusion);

            let primary = if config.direct {
                identifiers
                    .iter()
                    .map(|identifier| DownloadTask {
                        oid: identifier.oid.clone(),
                        request: DownloadRequest::Direct,
                    })
                    .collect::<Vec<_>>()
            } else {
                derive_tasks(
                    &layout,
                    &identifiers,
                    &HashSet::new(),
                    &mut ledger,
                    ListingKind::Primary,
                )
            };
            let primary_oids = primary
                .iter()
                .map(|task| task.oid.clone())
                .collect::<HashSet<_>>();

            let start = Instant::now();
            self.download_stage(
                "download",
                config,
                &layout,
                &downloader,
                &transformer,
                &session,
                primary,
                &mut ledger,
                &mut stages,
            );
            emit(sink, "phase=Download; all shards finished", Some(start.elapsed()));

            if config.project_field.is_some() && !config.direct {
                let by_project = derive_tasks(
                    &layout,
                    &identifiers,
                    &primary_oids,
                    &mut ledger,
                    ListingKind::Project,
                );
                let start = Instant::now();
                self.download_stage(
                    "download-project",
                    config,
                    &layout,
                    &downloader,
                    &transformer,
                    &session,
                    by_project,
                    &mut ledger,
                    &mut stages,
                );
                emit(sink, "phase=ProjectDownload; all shards finished", Some(start.elapsed()));
            }

            for entry in &mut ledger.entries {
                if entry.state == IdentifierState::Unresolved {
                    entry.state = IdentifierState::ResolutionError;
                    entry.message = Some("no listing document found".to_string());
                }
            }
        }

        emit(sink, "phase=Teardown; removing staging directory", None);
        drop(session);
        if let Err(err) = layout.teardown() {
            warn!(error = %err, "teardown failed");
        }

        let report = RunReport {
            tool: tool_name(),
            started_at,
            finished_at: iso_timestamp(),
            dry_run: false,
            stages,
            identifiers: ledger.entries,
        };
        let bytes = serde_json::to_vec_pretty(&report)
            .map_err(|err| PortalError::Filesystem(err.to_string()))?;
        write_bytes_atomic(&layout.report_path(), &bytes)?;
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_stage(
        &self,
        config: &RunConfig,
        layout: &OutputLayout,
        resolver: &MetadataResolver<'_, P>,
        session: &SessionToken,
        identifiers: &[Identifier],
        ledger: &mut Ledger,
        stages: &mut Vec<StagePlan>,
    ) {
        let mut pending = Vec::new();
        for identifier in identifiers {
            let existing = [
                layout.listing_path(&identifier.oid),
                layout.project_listing_path(&identifier.oid),
            ]
            .into_iter()
            .find(|path| path.as_std_path().exists());
            match existing {
                Some(path) if config.resume => {
                    if let Some(entry) = ledger.entry(&identifier.oid) {
                        entry.state = IdentifierState::Resolved;
                        entry.listing = Some(path.to_string());
                        entry.message = Some("listing already present".to_string());
                    }
                }
                _ => pending.push(identifier.clone()),
            }
        }

        let mut unfinished = pending
            .iter()
            .map(|identifier| identifier.oid.clone())
            .collect::<HashSet<_>>();
        let shards = partition(pending, config.connection_limit, config.shard_strategy);
        stages.push(plan_of("resolve", &shards, |identifier| identifier.oid.to_string()));
        let results = run_sharded("resolve", shards, |_, identifier: Identifier| {
            let result = resolver.resolve(&identifier, session);
            (identifier.oid, result)
        });

        for (oid, result) in results {
            unfinished.remove(&oid);
            match result {
                Ok(resolved) => {
                    if let Some(entry) = ledger.entry(&oid) {
                        entry.state = IdentifierState::Resolved;
                        entry.listing = Some(resolved.path.to_string());
                    }
                }
                Err(err) => {
                    ledger.set(&oid, IdentifierState::ResolutionError, Some(err.to_string()))
                }
            }
        }
        for oid in unfinished {
            ledger.set(
                &oid,
                IdentifierState::ResolutionError,
                Some("resolution work item panicked".to_string()),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn download_stage(
        &self,
        stage: &str,
        config: &RunConfig,
        layout: &OutputLayout,
        downloader: &Downloader<'_, P>,
        transformer: &ArchiveTransformer<'_>,
        session: &SessionToken,
        tasks: Vec<DownloadTask>,
        ledger: &mut Ledger,
        stages: &mut Vec<StagePlan>,
    ) {
        let mut pending = Vec::new();
        for task in tasks {
            let existing = if config.resume {
                existing_artifact(layout, &task, config.shrink)
            } else {
                None
            };
            match existing {
                Some((path, state)) => {
                    if let Some(entry) = ledger.entry(&task.oid) {
                        entry.state = state;
                        entry.artifact = Some(path.to_string());
                        entry.message = Some("artifact already present".to_string());
                    }
                }
                None => pending.push(task),
            }
        }

        let mut unfinished = pending
            .iter()
            .map(|task| task.oid.clone())
            .collect::<HashSet<_>>();
        let shards = partition(pending, config.connection_limit, config.shard_strategy);
        stages.push(plan_of(stage, &shards, |task| task.oid.to_string()));
        let results = run_sharded(stage, shards, |_, task: DownloadTask| {
            process_task(task, layout, downloader, transformer, session, config.shrink)
        });

        for outcome in results {
            unfinished.remove(&outcome.oid);
            if let Some(entry) = ledger.entry(&outcome.oid) {
                entry.state = outcome.state;
                entry.artifact = outcome.artifact.map(|path| path.to_string());
                if outcome.message.is_some() {
                    entry.message = outcome.message;
                }
            }
        }
        for oid in unfinished {
            ledger.set(
                &oid,
                IdentifierState::DownloadError,
                Some("download work item panicked".to_string()),
            );
        }
    }

    fn plan(
        &self,
        config: &RunConfig,
        layout: &OutputLayout,
        identifiers: &[Identifier],
        ledger: &mut Ledger,
        stages: &mut Vec<StagePlan>,
        sink: &dyn ProgressSink,
    ) {
        emit(sink, "phase=Plan; dry run, nothing is downloaded", None);
        let limit = config.connection_limit;
        if config.direct || config.listing_dir.is_none() {
            let stage = if config.direct { "download" } else { "resolve" };
            let shards = partition(identifiers.to_vec(), limit, config.shard_strategy);
            stages.push(plan_of(stage, &shards, |identifier| identifier.oid.to_string()));
            return;
        }
        let tasks = derive_tasks(
            layout,
            identifiers,
            &HashSet::new(),
            ledger,
            ListingKind::Primary,
        );
        let shards = partition(tasks, limit, config.shard_strategy);
        stages.push(plan_of("download", &shards, |task| task.oid.to_string()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListingKind {
    Primary,
    Project,
}

/// Builds download tasks from stored listings, in input order. Identifiers
/// without a listing of this kind, or listed in `skip`, are left untouched.
fn derive_tasks(
    layout: &OutputLayout,
    identifiers: &[Identifier],
    skip: &HashSet<TaxonOid>,
    ledger: &mut Ledger,
    kind: ListingKind,
) -> Vec<DownloadTask> {
    let mut tasks = Vec::new();
    for identifier in identifiers {
        let oid = &identifier.oid;
        if skip.contains(oid) || ledger.state(oid) == Some(IdentifierState::ResolutionError) {
            continue;
        }
        let name = match kind {
            ListingKind::Primary => format!("{oid}.xml"),
            ListingKind::Project => format!("proj_{oid}.xml"),
        };
        let path = layout.listing_root().join(name);
        if !path.as_std_path().is_file() {
            continue;
        }
        let listing = fs::read_to_string(path.as_std_path())
            .map_err(|err| PortalError::Filesystem(err.to_string()))
            .and_then(|xml| ListingDocument::parse(oid.clone(), &xml));
        let Some(entry) = ledger.entry(oid) else {
            continue;
        };
        entry.listing = Some(path.to_string());
        match listing {
            Ok(document) => match locate(&document) {
                Location::Url(url) => {
                    entry.state = IdentifierState::Located;
                    tasks.push(DownloadTask {
                        oid: oid.clone(),
                        request: DownloadRequest::Located(url),
                    });
                }
                Location::Unresolved => {
                    let reason = PortalError::UnresolvedLocation(oid.to_string());
                    info!(%oid, "{reason}");
                    entry.state = IdentifierState::UnresolvedLocation;
                    entry.message = Some(reason.to_string());
                }
            },
            Err(err) => {
                warn!(%oid, error = %err, "unreadable listing");
                entry.state = IdentifierState::UnresolvedLocation;
                entry.message = Some(err.to_string());
            }
        }
    }
    tasks
}

fn process_task<P: PortalClient>(
    task: DownloadTask,
    layout: &OutputLayout,
    downloader: &Downloader<'_, P>,
    transformer: &ArchiveTransformer<'_>,
    session: &SessionToken,
    shrink: bool,
) -> TaskOutcome {
    let oid = task.oid.clone();
    let artifact = match downloader.fetch(&task, session) {
        Ok(artifact) => artifact,
        Err(err) => {
            return TaskOutcome {
                oid,
                state: IdentifierState::DownloadError,
                artifact: None,
                message: Some(err.to_string()),
            };
        }
    };

    if !shrink {
        let dest = layout.raw_bundle_path(&oid, artifact.origin);
        return match artifact.persist_to(&dest) {
            Ok(()) => {
                info!(%oid, path = %dest, "bundle written");
                TaskOutcome {
                    oid,
                    state: IdentifierState::Downloaded,
                    artifact: Some(dest),
                    message: None,
                }
            }
            Err(err) => TaskOutcome {
                oid,
                state: IdentifierState::DownloadError,
                artifact: None,
                message: Some(err.to_string()),
            },
        };
    }

    match transformer.transform(artifact) {
        Ok(TransformOutcome::Transformed { path, stats, .. }) => TaskOutcome {
            oid,
            state: IdentifierState::Transformed,
            artifact: Some(path),
            message: Some(format!("kept {} members, removed {}", stats.kept, stats.removed)),
        },
        Ok(TransformOutcome::FallbackRaw { path, reason }) => TaskOutcome {
            oid,
            state: IdentifierState::TransformFallbackRaw,
            artifact: Some(path),
            message: Some(reason),
        },
        Ok(TransformOutcome::Skipped { path }) => TaskOutcome {
            oid,
            state: IdentifierState::TransformSkipped,
            artifact: Some(path),
            message: Some("bundle is neither tar nor gzip".to_string()),
        },
        Err(err) => TaskOutcome {
            oid,
            state: IdentifierState::TransformFallbackRaw,
            artifact: None,
            message: Some(err.to_string()),
        },
    }
}

/// A finished artifact from an earlier run and the state it stands for. Under
/// `shrink` a `_raw` file means that run fell back to the raw bytes.
fn existing_artifact(
    layout: &OutputLayout,
    task: &DownloadTask,
    shrink: bool,
) -> Option<(Utf8PathBuf, IdentifierState)> {
    let origins: &[BundleOrigin] = match task.request {
        DownloadRequest::Direct => &[BundleOrigin::Direct],
        DownloadRequest::Located(_) => &[BundleOrigin::Located, BundleOrigin::Rescued],
    };
    origins
        .iter()
        .flat_map(|origin| {
            if shrink {
                vec![
                    (
                        layout.shrinked_path(&task.oid, *origin),
                        IdentifierState::Transformed,
                    ),
                    (
                        layout.shrinked_fallback_path(&task.oid, *origin),
                        IdentifierState::TransformFallbackRaw,
                    ),
                ]
            } else {
                vec![(
                    layout.raw_bundle_path(&task.oid, *origin),
                    IdentifierState::Downloaded,
                )]
            }
        })
        .find(|(path, _)| path.as_std_path().exists())
}

fn dedupe(identifiers: &[Identifier]) -> Vec<Identifier> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(identifiers.len());
    for identifier in identifiers {
        if seen.insert(identifier.oid.clone()) {
            unique.push(identifier.clone());
        } else {
            warn!(oid = %identifier.oid, "duplicate identifier ignored");
        }
    }
    unique
}

fn plan_of<T>(stage: &str, shards: &[Shard<T>], label: impl Fn(&T) -> String) -> StagePlan {
    StagePlan {
        stage: stage.to_string(),
        shards: shards
            .iter()
            .map(|shard| shard.items.iter().map(&label).collect())
            .collect(),
    }
}

fn emit(sink: &dyn ProgressSink, message: &str, elapsed: Option<Duration>) {
    info!("{message}");
    sink.event(ProgressEvent {
        message: message.to_string(),
        elapsed,
    });
}

fn tool_name() -> String {
    format!("gpfetch/{}", env!("CARGO_PKG_VERSION"))
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
