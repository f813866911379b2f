use camino::Utf8PathBuf;
use tracing::{info, warn};

use crate::config::PortalEndpoints;
use crate::domain::{ContentClass, Identifier, ProjectId, TaxonOid};
use crate::error::PortalError;
use crate::listing::ListingDocument;
use crate::portal::PortalClient;
use crate::session::SessionToken;
use crate::store::{OutputLayout, write_bytes_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingSource {
    Primary,
    ByProject,
}

#[derive(Debug, Clone)]
pub struct ResolvedListing {
    pub document: ListingDocument,
    pub source: ListingSource,
    pub path: Utf8PathBuf,
}

/// Result of the project-id lookup chain: either a parsed listing or the body
/// the portal answered with instead.
pub enum ProjectListing {
    Found {
        document: ListingDocument,
        raw: Vec<u8>,
    },
    Rejected {
        body: Vec<u8>,
    },
}

pub struct MetadataResolver<'a, P: PortalClient> {
    portal: &'a P,
    endpoints: &'a PortalEndpoints,
    layout: &'a OutputLayout,
    use_project: bool,
}

impl<'a, P: PortalClient> MetadataResolver<'a, P> {
    pub fn new(
        portal: &'a P,
        endpoints: &'a PortalEndpoints,
        layout: &'a OutputLayout,
        use_project: bool,
    ) -> Self {
        Self {
            portal,
            endpoints,
            layout,
            use_project,
        }
    }

    /// Fetches and persists the listing of one identifier, falling back to the
    /// project lookup when the listing-by-id request does not answer with XML.
    /// Failures leave an `ERR_{id}.err` artifact behind.
    pub fn resolve(
        &self,
        identifier: &Identifier,
        session: &SessionToken,
    ) -> Result<ResolvedListing, PortalError> {
        let oid = &identifier.oid;
        match self.try_resolve(identifier, session) {
            Ok(Ok(resolved)) => {
                info!(%oid, source = ?resolved.source, path = %resolved.path, "listing stored");
                Ok(resolved)
            }
            Ok(Err(body)) => {
                let path = self.layout.resolution_error_path(oid);
                write_bytes_atomic(&path, &body)?;
                warn!(%oid, path = %path, "no listing document");
                Err(PortalError::Resolution(oid.to_string()))
            }
            Err(err) => {
                let path = self.layout.resolution_error_path(oid);
                write_bytes_atomic(&path, err.to_string().as_bytes())?;
                warn!(%oid, error = %err, "listing request failed");
                Err(PortalError::Resolution(oid.to_string()))
            }
        }
    }

    fn try_resolve(
        &self,
        identifier: &Identifier,
        session: &SessionToken,
    ) -> Result<Result<ResolvedListing, Vec<u8>>, PortalError> {
        let oid = &identifier.oid;
        let url = self.endpoints.listing_url(&format!("IMG_{oid}"));
        let response = self.portal.get(&url, session)?;
        let is_xml = response.content == ContentClass::Xml;
        let body = response.bytes()?;
        if is_xml {
            if let Some(document) = parse_listing(oid, &body) {
                let path = self.layout.listing_path(oid);
                write_bytes_atomic(&path, &body)?;
                return Ok(Ok(ResolvedListing {
                    document,
                    source: ListingSource::Primary,
                    path,
                }));
            }
        }

        let project = match (&identifier.project, self.use_project) {
            (Some(project), true) => project,
            _ => return Ok(Err(body)),
        };
        match self.project_listing(oid, project, session)? {
            ProjectListing::Found { document, raw } => {
                let path = self.layout.project_listing_path(oid);
                write_bytes_atomic(&path, &raw)?;
                Ok(Ok(ResolvedListing {
                    document,
                    source: ListingSource::ByProject,
                    path,
                }))
            }
            ProjectListing::Rejected { body } => Ok(Err(body)),
        }
    }

    /// Follows the project lookup redirect to the canonical organism name and
    /// requests the listing under that name. A lookup that does not redirect is
    /// rejected. Nothing is persisted here.
    pub fn project_listing(
        &self,
        oid: &TaxonOid,
        project: &ProjectId,
        session: &SessionToken,
    ) -> Result<ProjectListing, PortalError> {
        let lookup_url = self.endpoints.project_lookup_url(project);
        let lookup = self.portal.get(&lookup_url, session)?;
        // An answer at the lookup URL itself carries no canonical name.
        let name = (lookup.final_url != lookup_url)
            .then(|| lookup.redirect_name().map(str::to_string))
            .flatten();
        let Some(name) = name else {
            let body = lookup.bytes()?;
            return Ok(ProjectListing::Rejected { body });
        };
        info!(%oid, %project, organism = %name, "resolved project id");

        let response = self
            .portal
            .get(&self.endpoints.listing_url(&name), session)?;
        let is_xml = response.content == ContentClass::Xml;
        let body = response.bytes()?;
        if is_xml {
            if let Some(document) = parse_listing(oid, &body) {
                return Ok(ProjectListing::Found {
                    document,
                    raw: body,
                });
            }
        }
        Ok(ProjectListing::Rejected { body })
    }
}

fn parse_listing(oid: &TaxonOid, body: &[u8]) -> Option<ListingDocument> {
    let text = String::from_utf8_lossy(body);
    match ListingDocument::parse(oid.clone(), &text) {
        Ok(document) => Some(document),
        Err(err) => {
            warn!(%oid, error = %err, "listing advertised as XML but unreadable");
            None
        }
    }
}
