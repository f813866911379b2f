use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::PortalError;

/// Primary identifier of a genome or metagenome in the portal (an IMG taxon OID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaxonOid(String);

impl TaxonOid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaxonOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaxonOid {
    type Err = PortalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_path_safe(normalized) {
            return Err(PortalError::InvalidOid(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// Secondary identifier: the portal's sequencing project id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = PortalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_path_safe(normalized) {
            return Err(PortalError::InvalidConfig(format!(
                "invalid project id: {value}"
            )));
        }
        Ok(Self(normalized.to_string()))
    }
}

// Identifiers end up in file names, so they must not contain separators or dots.
fn is_path_safe(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub oid: TaxonOid,
    pub project: Option<ProjectId>,
}

impl Identifier {
    pub fn new(oid: TaxonOid) -> Self {
        Self { oid, project: None }
    }

    pub fn with_project(oid: TaxonOid, project: ProjectId) -> Self {
        Self {
            oid,
            project: Some(project),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentifierState {
    Unresolved,
    Resolved,
    ResolutionError,
    Located,
    UnresolvedLocation,
    Downloaded,
    DownloadError,
    Transformed,
    TransformFallbackRaw,
    TransformSkipped,
}

impl IdentifierState {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            IdentifierState::ResolutionError
                | IdentifierState::UnresolvedLocation
                | IdentifierState::DownloadError
        )
    }
}

impl fmt::Display for IdentifierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IdentifierState::Unresolved => "unresolved",
            IdentifierState::Resolved => "resolved",
            IdentifierState::ResolutionError => "resolution error",
            IdentifierState::Located => "located",
            IdentifierState::UnresolvedLocation => "unresolved location",
            IdentifierState::Downloaded => "downloaded",
            IdentifierState::DownloadError => "download error",
            IdentifierState::Transformed => "transformed",
            IdentifierState::TransformFallbackRaw => "transform fallback (raw)",
            IdentifierState::TransformSkipped => "transform skipped",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Gzip,
    OctetStream,
}

/// Classification of a portal response, computed once from its `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Binary(BinaryKind),
    Html,
    Xml,
    Unknown,
}

impl ContentClass {
    pub fn from_content_type(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return ContentClass::Unknown;
        };
        let mime = value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "application/x-gzip" | "application/gzip" => ContentClass::Binary(BinaryKind::Gzip),
            "application/octet-stream" => ContentClass::Binary(BinaryKind::OctetStream),
            "application/xml" | "text/xml" => ContentClass::Xml,
            "text/html" => ContentClass::Html,
            _ => ContentClass::Unknown,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, ContentClass::Binary(_))
    }
}

/// How the bundle URL of an identifier was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleOrigin {
    /// Canonical per-OID bundle URL, no listing involved.
    Direct,
    /// URL taken from a resolved listing document.
    Located,
    /// URL found after scraping the taxon page and resolving via the project id.
    Rescued,
}

impl BundleOrigin {
    pub fn suffix(&self) -> &'static str {
        match self {
            BundleOrigin::Direct => "oid",
            BundleOrigin::Located => "proj",
            BundleOrigin::Rescued => "proj2",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ShardStrategy {
    #[default]
    RoundRobin,
    StableHash,
}
