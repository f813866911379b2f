use std::io::Write;

use camino::Utf8Path;
use regex::Regex;
use scraper::{Html, Selector};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::config::PortalEndpoints;
use crate::domain::{BinaryKind, BundleOrigin, ContentClass, ProjectId, TaxonOid};
use crate::error::PortalError;
use crate::listing::{Location, locate};
use crate::portal::{PortalClient, PortalResponse};
use crate::resolver::{MetadataResolver, ProjectListing};
use crate::session::SessionToken;
use crate::store::{OutputLayout, copy_file_atomic, write_bytes_atomic};

/// How the downloader should obtain the bundle of one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadRequest {
    /// Build the canonical per-OID bundle URL.
    Direct,
    /// Use the URL the locator picked from a listing document.
    Located(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub oid: TaxonOid,
    pub request: DownloadRequest,
}

/// Raw bundle bytes staged in the temp directory. The staging file is removed
/// when the artifact is dropped, so callers must persist or transform it first.
#[derive(Debug)]
pub struct ArchiveArtifact {
    pub oid: TaxonOid,
    pub origin: BundleOrigin,
    pub content: ContentClass,
    pub bytes: u64,
    pub staged: NamedTempFile,
}

impl ArchiveArtifact {
    /// Moves the staged bytes to `dest`, copying when a rename is not possible.
    pub fn persist_to(self, dest: &Utf8Path) -> Result<(), PortalError> {
        match self.staged.persist(dest.as_std_path()) {
            Ok(_) => Ok(()),
            Err(err) => {
                let staged = err.file;
                copy_file_atomic(staged.path(), dest)
            }
        }
    }
}

pub struct Downloader<'a, P: PortalClient> {
    portal: &'a P,
    endpoints: &'a PortalEndpoints,
    layout: &'a OutputLayout,
    resolver: &'a MetadataResolver<'a, P>,
}

impl<'a, P: PortalClient> Downloader<'a, P> {
    pub fn new(
        portal: &'a P,
        endpoints: &'a PortalEndpoints,
        layout: &'a OutputLayout,
        resolver: &'a MetadataResolver<'a, P>,
    ) -> Self {
        Self {
            portal,
            endpoints,
            layout,
            resolver,
        }
    }

    pub fn fetch(
        &self,
        task: &DownloadTask,
        session: &SessionToken,
    ) -> Result<ArchiveArtifact, PortalError> {
        match &task.request {
            DownloadRequest::Direct => self.fetch_direct(&task.oid, session),
            DownloadRequest::Located(url) => self.fetch_located(&task.oid, url, session),
        }
    }

    fn fetch_direct(
        &self,
        oid: &TaxonOid,
        session: &SessionToken,
    ) -> Result<ArchiveArtifact, PortalError> {
        let url = self.endpoints.direct_bundle_url(oid);
        let response = self.portal.get(&url, session)?;
        if response.content == ContentClass::Binary(BinaryKind::Gzip) {
            return self.stage(oid, BundleOrigin::Direct, response);
        }
        let content = response.content;
        let body = response.bytes()?;
        self.fail(oid, false, &body, format!("portal answered {content:?}"))
    }

    fn fetch_located(
        &self,
        oid: &TaxonOid,
        located: &str,
        session: &SessionToken,
    ) -> Result<ArchiveArtifact, PortalError> {
        let response = self
            .portal
            .get(&self.endpoints.download_url(located), session)?;
        if response.content.is_binary() {
            return self.stage(oid, BundleOrigin::Located, response);
        }
        warn!(%oid, content = ?response.content, "no archive in response, trying project lookup");
        drop(response);
        self.rescue(oid, session)
    }

    /// One-shot cascade: taxon page → project id → listing → locator → single retry.
    fn rescue(
        &self,
        oid: &TaxonOid,
        session: &SessionToken,
    ) -> Result<ArchiveArtifact, PortalError> {
        let detail = self
            .portal
            .get(&self.endpoints.taxon_detail_url(oid), session)?
            .bytes()?;
        let html = String::from_utf8_lossy(&detail);
        let Some(project) = scrape_project_id(&html)? else {
            return self.fail(oid, true, &detail, "no project link on taxon page".to_string());
        };

        let (document, raw) = match self.resolver.project_listing(oid, &project, session)? {
            ProjectListing::Found { document, raw } => (document, raw),
            ProjectListing::Rejected { body } => {
                return self.fail(oid, true, &body, "project listing unavailable".to_string());
            }
        };
        let url = match locate(&document) {
            Location::Url(url) => url,
            Location::Unresolved => {
                let reason = "project listing has no bundle".to_string();
                return self.fail(oid, true, &raw, reason);
            }
        };

        let response = self.portal.get(&self.endpoints.download_url(&url), session)?;
        if response.content.is_binary() {
            return self.stage(oid, BundleOrigin::Rescued, response);
        }
        let content = response.content;
        let body = response.bytes()?;
        self.fail(oid, true, &body, format!("retry answered {content:?}"))
    }

    fn stage(
        &self,
        oid: &TaxonOid,
        origin: BundleOrigin,
        response: PortalResponse,
    ) -> Result<ArchiveArtifact, PortalError> {
        let content = response.content;
        let mut staged = self.layout.staging_file(oid)?;
        let bytes = response.copy_to(staged.as_file_mut())?;
        staged
            .as_file_mut()
            .flush()
            .map_err(|err| PortalError::Filesystem(err.to_string()))?;
        info!(%oid, origin = origin.suffix(), bytes, "bundle downloaded");
        Ok(ArchiveArtifact {
            oid: oid.clone(),
            origin,
            content,
            bytes,
            staged,
        })
    }

    fn fail<T>(
        &self,
        oid: &TaxonOid,
        cascade: bool,
        body: &[u8],
        reason: String,
    ) -> Result<T, PortalError> {
        let path = self.layout.download_error_path(oid, cascade);
        write_bytes_atomic(&path, body)?;
        warn!(%oid, path = %path, %reason, "download failed");
        Err(PortalError::Download {
            id: oid.to_string(),
            reason,
        })
    }
}

/// Finds the first project lookup hyperlink on a taxon detail page.
pub fn scrape_project_id(html: &str) -> Result<Option<ProjectId>, PortalError> {
    let pattern = Regex::new(r"lookup\?keyName=jgiProjectId&keyValue=([A-Za-z0-9_-]+)")
        .map_err(|err| PortalError::Download {
            id: String::new(),
            reason: err.to_string(),
        })?;
    let selector = Selector::parse("a[href]").map_err(|err| PortalError::Download {
        id: String::new(),
        reason: err.to_string(),
    })?;
    let document = Html::parse_document(html);
    for link in document.select(&selector) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if let Some(captures) = pattern.captures(href.trim()) {
            return captures[1].parse().map(Some);
        }
    }
    Ok(None)
}
