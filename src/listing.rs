use quick_xml::Reader;
use quick_xml::events::Event;

use crate::domain::TaxonOid;
use crate::error::PortalError;

pub const CANONICAL_BUNDLE: &str = "download_bundle.tar.gz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub filename: String,
    pub url: String,
}

/// The portal's file manifest for one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingDocument {
    pub oid: TaxonOid,
    pub entries: Vec<ListingEntry>,
}

impl ListingDocument {
    /// Collects every `<file>` element that carries both `filename` and `url`,
    /// regardless of how deeply it is nested in folders.
    pub fn parse(oid: TaxonOid, xml: &str) -> Result<Self, PortalError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut entries = Vec::new();
        let mut saw_root = false;
        loop {
            match reader.read_event() {
                Ok(Event::Start(element)) | Ok(Event::Empty(element)) => {
                    saw_root = true;
                    if element.name().as_ref() != b"file" {
                        continue;
                    }
                    let filename = attribute(&element, "filename")?;
                    let url = attribute(&element, "url")?;
                    if let (Some(filename), Some(url)) = (filename, url) {
                        entries.push(ListingEntry { filename, url });
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(err) => {
                    return Err(PortalError::ListingParse(format!(
                        "{oid} at byte {}: {err}",
                        reader.error_position()
                    )));
                }
            }
        }
        if !saw_root {
            return Err(PortalError::ListingParse(format!("{oid}: empty document")));
        }
        Ok(Self { oid, entries })
    }

    pub fn url_for(&self, filename: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.filename == filename)
            .map(|entry| entry.url.as_str())
    }
}

fn attribute(
    element: &quick_xml::events::BytesStart<'_>,
    name: &str,
) -> Result<Option<String>, PortalError> {
    let Some(attr) = element
        .try_get_attribute(name)
        .map_err(|err| PortalError::ListingParse(err.to_string()))?
    else {
        return Ok(None);
    };
    let value = attr
        .unescape_value()
        .map_err(|err| PortalError::ListingParse(err.to_string()))?;
    Ok(Some(value.into_owned()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Url(String),
    Unresolved,
}

/// Picks the bundle to download: the canonical bundle wins over `{oid}.tar.gz`.
pub fn locate(listing: &ListingDocument) -> Location {
    if let Some(url) = listing.url_for(CANONICAL_BUNDLE) {
        return Location::Url(url.to_string());
    }
    let fallback = format!("{}.tar.gz", listing.oid);
    match listing.url_for(&fallback) {
        Some(url) => Location::Url(url.to_string()),
        None => Location::Unresolved,
    }
}
