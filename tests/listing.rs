mod common;

use assert_matches::assert_matches;

use genomeportal_fetch::domain::TaxonOid;
use genomeportal_fetch::error::PortalError;
use genomeportal_fetch::listing::{ListingDocument, Location, locate};

use common::listing_xml;

fn parse(oid: &str, xml: &str) -> ListingDocument {
    let oid: TaxonOid = oid.parse().unwrap();
    ListingDocument::parse(oid, xml).unwrap()
}

#[test]
fn canonical_bundle_wins() {
    let xml = listing_xml(&[("1001.tar.gz", "/y"), ("download_bundle.tar.gz", "/x")]);
    let document = parse("1001", &xml);
    assert_eq!(document.entries.len(), 2);
    assert_eq!(locate(&document), Location::Url("/x".to_string()));
}

#[test]
fn falls_back_to_id_tarball() {
    let xml = listing_xml(&[("README.txt", "/r"), ("1001.tar.gz", "/y")]);
    assert_eq!(locate(&parse("1001", &xml)), Location::Url("/y".to_string()));
}

#[test]
fn other_identifier_tarball_is_not_used() {
    let xml = listing_xml(&[("1002.tar.gz", "/z"), ("notes.txt", "/n")]);
    assert_eq!(locate(&parse("1001", &xml)), Location::Unresolved);
}

#[test]
fn first_of_duplicate_entries_wins() {
    let xml = listing_xml(&[
        ("download_bundle.tar.gz", "/first"),
        ("download_bundle.tar.gz", "/second"),
    ]);
    assert_eq!(locate(&parse("1001", &xml)), Location::Url("/first".to_string()));
}

#[test]
fn escaped_urls_are_unescaped() {
    let xml = listing_xml(&[(
        "download_bundle.tar.gz",
        "/ext-api/downloads/get_tape_file?blocking=true&amp;url=/IMG/1001.tar.gz",
    )]);
    assert_eq!(
        locate(&parse("1001", &xml)),
        Location::Url(
            "/ext-api/downloads/get_tape_file?blocking=true&url=/IMG/1001.tar.gz".to_string()
        )
    );
}

#[test]
fn malformed_document_is_rejected() {
    let oid: TaxonOid = "1001".parse().unwrap();
    let err = ListingDocument::parse(oid.clone(), "<organismDownloads><folder></organismDownloads>")
        .unwrap_err();
    assert_matches!(err, PortalError::ListingParse(_));
    let err = ListingDocument::parse(oid, "").unwrap_err();
    assert_matches!(err, PortalError::ListingParse(_));
}
