mod common;

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use genomeportal_fetch::config::PortalEndpoints;
use genomeportal_fetch::domain::{BundleOrigin, TaxonOid};
use genomeportal_fetch::downloader::{ArchiveArtifact, DownloadRequest, DownloadTask, Downloader};
use genomeportal_fetch::error::PortalError;
use genomeportal_fetch::resolver::MetadataResolver;
use genomeportal_fetch::session::SessionToken;
use genomeportal_fetch::store::OutputLayout;

use common::{MockPortal, Reply, bundle, endpoints, listing_xml};

const TAXON_PAGE: &str = r#"<html><body>
<a href="main.cgi?section=TaxonDetail">self</a>
<a href="https://portal.test/lookup?keyName=jgiProjectId&amp;keyValue=407984">Project</a>
</body></html>"#;

fn session() -> SessionToken {
    let mut cookies = BTreeMap::new();
    cookies.insert("jgi_session".to_string(), "token42".to_string());
    SessionToken::new(cookies)
}

fn layout(dir: &TempDir) -> OutputLayout {
    let root = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
    let layout = OutputLayout::new(root, None);
    layout.bootstrap(false).unwrap();
    layout
}

fn located(oid: &str, url: &str) -> DownloadTask {
    DownloadTask {
        oid: oid.parse().unwrap(),
        request: DownloadRequest::Located(url.to_string()),
    }
}

fn cascade_routes(portal: MockPortal, retry: Reply) -> MockPortal {
    portal
        .route("https://img.portal.test/taxon?taxon_oid=1001", Reply::html(TAXON_PAGE))
        .route(
            "https://portal.test/lookup?keyName=jgiProjectId&keyValue=407984",
            Reply::redirect("https://portal.test/portal/lookup?organism=Acme_bug"),
        )
        .route(
            "https://portal.test/get-directory?organism=Acme_bug",
            Reply::xml(&listing_xml(&[("download_bundle.tar.gz", "/retry/1001")])),
        )
        .route("https://portal.test/retry/1001", retry)
}

fn run(
    portal: &MockPortal,
    endpoints: &PortalEndpoints,
    layout: &OutputLayout,
    task: &DownloadTask,
) -> Result<ArchiveArtifact, PortalError> {
    let resolver = MetadataResolver::new(portal, endpoints, layout, true);
    let downloader = Downloader::new(portal, endpoints, layout, &resolver);
    downloader.fetch(task, &session())
}

#[test]
fn located_binary_is_staged() {
    let dir = TempDir::new().unwrap();
    let layout = layout(&dir);
    let endpoints = endpoints();
    let portal = MockPortal::new().route("https://portal.test/x", Reply::gzip(bundle("1001")));

    let artifact = run(&portal, &endpoints, &layout, &located("1001", "/x")).unwrap();
    assert_eq!(artifact.origin, BundleOrigin::Located);
    let mut staged = Vec::new();
    fs::File::open(artifact.staged.path())
        .unwrap()
        .read_to_end(&mut staged)
        .unwrap();
    assert_eq!(staged, bundle("1001"));
    assert_eq!(artifact.bytes, staged.len() as u64);
}

#[test]
fn html_answer_triggers_one_cascade() {
    let dir = TempDir::new().unwrap();
    let layout = layout(&dir);
    let endpoints = endpoints();
    let portal = cascade_routes(
        MockPortal::new().route("https://portal.test/x", Reply::html("<html>tape</html>")),
        Reply::gzip(bundle("1001")),
    );

    let artifact = run(&portal, &endpoints, &layout, &located("1001", "/x")).unwrap();
    assert_eq!(artifact.origin, BundleOrigin::Rescued);
    assert_eq!(
        portal.requests(),
        vec![
            "https://portal.test/x",
            "https://img.portal.test/taxon?taxon_oid=1001",
            "https://portal.test/lookup?keyName=jgiProjectId&keyValue=407984",
            "https://portal.test/get-directory?organism=Acme_bug",
            "https://portal.test/retry/1001",
        ]
    );
    let dest = layout.raw_bundle_path(&"1001".parse().unwrap(), artifact.origin);
    assert!(dest.ends_with("Downloads/1001.tar.gz"));
}

#[test]
fn failed_retry_does_not_cascade_again() {
    let dir = TempDir::new().unwrap();
    let layout = layout(&dir);
    let endpoints = endpoints();
    let portal = cascade_routes(
        MockPortal::new().route("https://portal.test/x", Reply::html("<html>tape</html>")),
        Reply::html("<html>still on tape</html>"),
    );

    let err = run(&portal, &endpoints, &layout, &located("1001", "/x")).unwrap_err();
    assert_matches!(err, PortalError::Download { ref id, .. } if id == "1001");
    assert_eq!(portal.count("taxon_oid=1001"), 1);
    assert_eq!(portal.count("/retry/1001"), 1);

    let oid: TaxonOid = "1001".parse().unwrap();
    let artifact = layout.download_error_path(&oid, true);
    assert!(artifact.ends_with("Downloads/ERROR_1001_proj.html"));
    assert_eq!(fs::read_to_string(&artifact).unwrap(), "<html>still on tape</html>");
}

#[test]
fn taxon_page_without_project_link() {
    let dir = TempDir::new().unwrap();
    let layout = layout(&dir);
    let endpoints = endpoints();
    let portal = MockPortal::new()
        .route("https://portal.test/x", Reply::html("<html>tape</html>"))
        .route(
            "https://img.portal.test/taxon?taxon_oid=1001",
            Reply::html("<html>no links</html>"),
        );

    let err = run(&portal, &endpoints, &layout, &located("1001", "/x")).unwrap_err();
    assert_matches!(err, PortalError::Download { .. });
    let oid: TaxonOid = "1001".parse().unwrap();
    assert!(layout.download_error_path(&oid, true).exists());
    assert_eq!(portal.requests().len(), 2);
}

#[test]
fn direct_mode_requires_gzip() {
    let dir = TempDir::new().unwrap();
    let layout = layout(&dir);
    let endpoints = endpoints();
    let portal = MockPortal::new().route(
        "https://portal.test/IMG_1001/download/download_bundle.tar.gz",
        Reply::html("<html>login</html>"),
    );
    let task = DownloadTask {
        oid: "1001".parse().unwrap(),
        request: DownloadRequest::Direct,
    };

    let err = run(&portal, &endpoints, &layout, &task).unwrap_err();
    assert_matches!(err, PortalError::Download { .. });
    let oid: TaxonOid = "1001".parse().unwrap();
    assert_eq!(
        fs::read_to_string(layout.download_error_path(&oid, false)).unwrap(),
        "<html>login</html>"
    );
    assert_eq!(portal.requests().len(), 1);
}

#[test]
fn cascade_listing_without_bundle() {
    let dir = TempDir::new().unwrap();
    let layout = layout(&dir);
    let endpoints = endpoints();
    let listing = listing_xml(&[("notes.txt", "/files/notes")]);
    let portal = cascade_routes(
        MockPortal::new().route("https://portal.test/x", Reply::html("<html>tape</html>")),
        Reply::gzip(bundle("1001")),
    )
    .route(
        "https://portal.test/get-directory?organism=Acme_bug",
        Reply::xml(&listing),
    );

    let err = run(&portal, &endpoints, &layout, &located("1001", "/x")).unwrap_err();
    assert_matches!(err, PortalError::Download { ref reason, .. } if reason.contains("no bundle"));
    let oid: TaxonOid = "1001".parse().unwrap();
    assert_eq!(
        fs::read_to_string(layout.download_error_path(&oid, true)).unwrap(),
        listing
    );
    assert_eq!(portal.count("/retry/1001"), 0);
}
