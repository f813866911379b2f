//! Shrinking of downloaded bundles.
//!
//! A bundle is streamed through three stages: a [`ArchiveSource`] that yields the
//! uncompressed tar stream, a [`MemberFilter`] that drops excluded members, and an
//! [`ArchiveSink`] that recompresses into the destination. Any stage failure leaves
//! the raw download in place of the shrinked one.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use glob::{MatchOptions, Pattern};
use serde::Serialize;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::config::ExclusionPolicy;
use crate::downloader::ArchiveArtifact;
use crate::error::PortalError;
use crate::store::{OutputLayout, copy_file_atomic};

const SEQUENCE_PATTERNS: &[&str] = &["*/*.f*a", "*/*.gff"];
const UNASSEMBLED_PATTERN: &str = "*/*.u*";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Tar,
    Gzip,
    Unknown,
}

/// Classifies a file by its leading bytes; the file name is never consulted.
pub fn sniff(path: &Path) -> io::Result<ArchiveKind> {
    let mut file = File::open(path)?;
    let mut head = [0u8; 512];
    let mut filled = 0;
    while filled < head.len() {
        let read = file.read(&mut head[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(classify(&head[..filled]))
}

pub fn classify(head: &[u8]) -> ArchiveKind {
    if head.starts_with(&[0x1f, 0x8b]) {
        ArchiveKind::Gzip
    } else if head.len() >= 262 && &head[257..262] == b"ustar" {
        ArchiveKind::Tar
    } else {
        ArchiveKind::Unknown
    }
}

/// Member name patterns that the filter stage deletes.
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    patterns: Vec<Pattern>,
}

impl ExclusionSet {
    pub fn new(patterns: &[&str]) -> Result<Self, PortalError> {
        let patterns = patterns
            .iter()
            .map(|raw| Pattern::new(raw).map_err(|err| PortalError::Transform(err.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// FASTA and GFF members are always excluded. Unassembled members are excluded
    /// when the policy asks for it, unless the keep flag is set and `members` has no
    /// assembled entry.
    pub fn for_policy(policy: ExclusionPolicy, members: &[String]) -> Result<Self, PortalError> {
        let mut patterns = SEQUENCE_PATTERNS.to_vec();
        if policy.remove_unassembled {
            let keep = policy.keep_unassembled_if_none_assembled
                && !members.iter().any(|name| is_assembled(name));
            if !keep {
                patterns.push(UNASSEMBLED_PATTERN);
            }
        }
        Self::new(&patterns)
    }

    pub fn is_excluded(&self, member: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.matches_with(member, MATCH_OPTIONS))
    }
}

pub fn is_assembled(member: &str) -> bool {
    member.contains(".a.") || member.contains(".a,")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub kept: usize,
    pub removed: usize,
}

pub trait ArchiveSource {
    fn open(&self, staged: &Path) -> io::Result<Box<dyn Read>>;
}

pub trait MemberFilter {
    fn filter(&self, input: &mut dyn Read, output: &mut dyn Write)
    -> Result<FilterStats, PortalError>;
}

pub trait FinishWrite: Write {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

pub trait ArchiveSink {
    fn wrap<'w>(&self, output: &'w mut dyn Write) -> Box<dyn FinishWrite + 'w>;
}

/// Reads a plain tar file.
pub struct TarSource;

impl ArchiveSource for TarSource {
    fn open(&self, staged: &Path) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(File::open(staged)?))
    }
}

/// Decompresses a gzip file into its tar stream. Concatenated gzip members are
/// decoded as one stream.
pub struct GunzipSource;

impl ArchiveSource for GunzipSource {
    fn open(&self, staged: &Path) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(MultiGzDecoder::new(File::open(staged)?)))
    }
}

impl MemberFilter for ExclusionSet {
    fn filter(
        &self,
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<FilterStats, PortalError> {
        let mut archive = tar::Archive::new(input);
        let mut builder = tar::Builder::new(output);
        let mut stats = FilterStats::default();
        for entry in archive.entries().map_err(transform_err)? {
            let mut entry = entry.map_err(transform_err)?;
            let path = entry.path().map_err(transform_err)?.into_owned();
            if self.is_excluded(&path.to_string_lossy()) {
                debug!(member = %path.display(), "removing member");
                stats.removed += 1;
                continue;
            }
            let mut header = entry.header().clone();
            builder
                .append_data(&mut header, &path, &mut entry)
                .map_err(transform_err)?;
            stats.kept += 1;
        }
        builder.into_inner().map_err(transform_err)?;
        // Read past the end-of-archive blocks so gzip trailer errors surface.
        io::copy(archive.into_inner(), &mut io::sink()).map_err(transform_err)?;
        Ok(stats)
    }
}

pub struct GzipSink {
    pub level: Compression,
}

impl Default for GzipSink {
    fn default() -> Self {
        Self {
            level: Compression::best(),
        }
    }
}

impl<W: Write> FinishWrite for GzEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        GzEncoder::finish(*self)?;
        Ok(())
    }
}

impl ArchiveSink for GzipSink {
    fn wrap<'w>(&self, output: &'w mut dyn Write) -> Box<dyn FinishWrite + 'w> {
        Box::new(GzEncoder::new(output, self.level))
    }
}

pub struct Pipeline<'a> {
    pub source: &'a dyn ArchiveSource,
    pub filter: &'a dyn MemberFilter,
    pub sink: &'a dyn ArchiveSink,
}

impl Pipeline<'_> {
    pub fn run(&self, staged: &Path, output: &mut dyn Write) -> Result<FilterStats, PortalError> {
        let mut input = self.source.open(staged).map_err(transform_err)?;
        let mut writer = self.sink.wrap(output);
        let stats = self.filter.filter(&mut input, &mut writer)?;
        writer.finish().map_err(transform_err)?;
        Ok(stats)
    }
}

/// Member names of the tar stream produced by `source`.
pub fn list_members(source: &dyn ArchiveSource, staged: &Path) -> Result<Vec<String>, PortalError> {
    let input = source.open(staged).map_err(transform_err)?;
    let mut archive = tar::Archive::new(input);
    let mut names = Vec::new();
    for entry in archive.entries().map_err(transform_err)? {
        let entry = entry.map_err(transform_err)?;
        names.push(entry.path().map_err(transform_err)?.to_string_lossy().into_owned());
    }
    Ok(names)
}

fn transform_err(err: io::Error) -> PortalError {
    PortalError::Transform(err.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransformOutcome {
    Transformed {
        path: Utf8PathBuf,
        kind: ArchiveKind,
        stats: FilterStats,
    },
    FallbackRaw {
        path: Utf8PathBuf,
        reason: String,
    },
    /// Content was neither tar nor gzip; the raw bytes are kept under the fallback name.
    Skipped { path: Utf8PathBuf },
}

impl TransformOutcome {
    pub fn path(&self) -> &Utf8PathBuf {
        match self {
            TransformOutcome::Transformed { path, .. }
            | TransformOutcome::FallbackRaw { path, .. }
            | TransformOutcome::Skipped { path } => path,
        }
    }
}

pub struct ArchiveTransformer<'a> {
    layout: &'a OutputLayout,
    policy: ExclusionPolicy,
    sink: GzipSink,
}

impl<'a> ArchiveTransformer<'a> {
    pub fn new(layout: &'a OutputLayout, policy: ExclusionPolicy) -> Self {
        Self {
            layout,
            policy,
            sink: GzipSink::default(),
        }
    }

    /// Shrinks a staged bundle into `Downloads/shrinked/`. The staged file is
    /// deleted when this returns, whatever the outcome; it is only kept on disk if
    /// it could not be relocated.
    pub fn transform(&self, artifact: ArchiveArtifact) -> Result<TransformOutcome, PortalError> {
        let oid = artifact.oid.clone();
        let fallback = self.layout.shrinked_fallback_path(&oid, artifact.origin);

        let kind = match sniff(artifact.staged.path()) {
            Ok(kind) => kind,
            Err(err) => {
                return self.retain_raw(artifact, fallback, format!("sniff failed: {err}"));
            }
        };
        let source: &dyn ArchiveSource = match kind {
            ArchiveKind::Tar => &TarSource,
            ArchiveKind::Gzip => &GunzipSource,
            ArchiveKind::Unknown => {
                warn!(%oid, "bundle is neither tar nor gzip, keeping it unchanged");
                self.relocate(artifact, &fallback)?;
                return Ok(TransformOutcome::Skipped { path: fallback });
            }
        };

        let final_path = self.layout.shrinked_path(&oid, artifact.origin);
        match self.shrink(source, artifact.staged.path(), &final_path) {
            Ok(stats) => {
                info!(
                    %oid,
                    ?kind,
                    kept = stats.kept,
                    removed = stats.removed,
                    path = %final_path,
                    "bundle shrinked"
                );
                Ok(TransformOutcome::Transformed {
                    path: final_path,
                    kind,
                    stats,
                })
            }
            Err(err) => self.retain_raw(artifact, fallback, err.to_string()),
        }
    }

    fn shrink(
        &self,
        source: &dyn ArchiveSource,
        staged: &Path,
        final_path: &Utf8PathBuf,
    ) -> Result<FilterStats, PortalError> {
        let policy = self.policy;
        let members = if policy.remove_unassembled && policy.keep_unassembled_if_none_assembled {
            list_members(source, staged)?
        } else {
            Vec::new()
        };
        let exclusions = ExclusionSet::for_policy(self.policy, &members)?;

        let parent = final_path
            .parent()
            .ok_or_else(|| PortalError::Filesystem("invalid destination path".to_string()))?;
        // Dropping the partial file on error discards it.
        let mut partial = Builder::new()
            .prefix(".gpfetch-shrink")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| PortalError::Filesystem(err.to_string()))?;
        let pipeline = Pipeline {
            source,
            filter: &exclusions,
            sink: &self.sink,
        };
        let stats = pipeline.run(staged, partial.as_file_mut())?;
        partial
            .persist(final_path.as_std_path())
            .map_err(|err| PortalError::Filesystem(err.to_string()))?;
        Ok(stats)
    }

    fn retain_raw(
        &self,
        artifact: ArchiveArtifact,
        fallback: Utf8PathBuf,
        reason: String,
    ) -> Result<TransformOutcome, PortalError> {
        warn!(oid = %artifact.oid, %reason, path = %fallback, "shrinking failed, keeping raw");
        self.relocate(artifact, &fallback)?;
        Ok(TransformOutcome::FallbackRaw {
            path: fallback,
            reason,
        })
    }

    fn relocate(&self, artifact: ArchiveArtifact, dest: &Utf8PathBuf) -> Result<(), PortalError> {
        if let Err(err) = copy_file_atomic(artifact.staged.path(), dest) {
            let kept = artifact
                .staged
                .keep()
                .map(|(_, path)| path.display().to_string())
                .unwrap_or_else(|_| "<lost>".to_string());
            return Err(PortalError::Filesystem(format!(
                "could not relocate raw bundle of {} ({err}); staged copy kept at {kept}",
                artifact.oid
            )));
        }
        Ok(())
    }
}
