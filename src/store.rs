use std::fs;
use std::io::Write;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, NamedTempFile};

use crate::domain::{BundleOrigin, TaxonOid};
use crate::error::PortalError;

/// On-disk layout of a run. Every artifact path is derived from the identifier,
/// so shards never write to the same file.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    dest_root: Utf8PathBuf,
    tmp_root: Utf8PathBuf,
    listing_root: Utf8PathBuf,
}

impl OutputLayout {
    /// Uses `{tmp}/gptdl` as the staging directory when a temp dir is given, and
    /// the downloads directory otherwise.
    pub fn new(dest_root: Utf8PathBuf, tmp_dir: Option<&Utf8Path>) -> Self {
        let tmp_root = match tmp_dir {
            Some(dir) => dir.join("gptdl"),
            None => dest_root.join("Downloads"),
        };
        let listing_root = dest_root.join("XML");
        Self {
            dest_root,
            tmp_root,
            listing_root,
        }
    }

    /// Reads listings from an externally supplied directory instead of `XML/`.
    pub fn with_listing_root(mut self, listing_root: Utf8PathBuf) -> Self {
        self.listing_root = listing_root;
        self
    }

    pub fn dest_root(&self) -> &Utf8Path {
        &self.dest_root
    }

    pub fn tmp_root(&self) -> &Utf8Path {
        &self.tmp_root
    }

    pub fn listing_root(&self) -> &Utf8Path {
        &self.listing_root
    }

    pub fn xml_dir(&self) -> Utf8PathBuf {
        self.dest_root.join("XML")
    }

    pub fn downloads_dir(&self) -> Utf8PathBuf {
        self.dest_root.join("Downloads")
    }

    pub fn shrinked_dir(&self) -> Utf8PathBuf {
        self.downloads_dir().join("shrinked")
    }

    pub fn listing_path(&self, oid: &TaxonOid) -> Utf8PathBuf {
        self.xml_dir().join(format!("{oid}.xml"))
    }

    pub fn project_listing_path(&self, oid: &TaxonOid) -> Utf8PathBuf {
        self.xml_dir().join(format!("proj_{oid}.xml"))
    }

    pub fn resolution_error_path(&self, oid: &TaxonOid) -> Utf8PathBuf {
        self.xml_dir().join(format!("ERR_{oid}.err"))
    }

    pub fn download_error_path(&self, oid: &TaxonOid, cascade: bool) -> Utf8PathBuf {
        let name = if cascade {
            format!("ERROR_{oid}_proj.html")
        } else {
            format!("ERROR_{oid}.html")
        };
        self.downloads_dir().join(name)
    }

    pub fn raw_bundle_path(&self, oid: &TaxonOid, origin: BundleOrigin) -> Utf8PathBuf {
        let name = match origin {
            BundleOrigin::Located => format!("{oid}_proj.tar.gz"),
            BundleOrigin::Direct | BundleOrigin::Rescued => format!("{oid}.tar.gz"),
        };
        self.downloads_dir().join(name)
    }

    pub fn shrinked_path(&self, oid: &TaxonOid, origin: BundleOrigin) -> Utf8PathBuf {
        self.shrinked_dir()
            .join(format!("{oid}_{}.tar.gz", origin.suffix()))
    }

    pub fn shrinked_fallback_path(&self, oid: &TaxonOid, origin: BundleOrigin) -> Utf8PathBuf {
        self.shrinked_dir()
            .join(format!("{oid}_{}_raw.tar.gz", origin.suffix()))
    }

    pub fn report_path(&self) -> Utf8PathBuf {
        self.dest_root.join("run-report.json")
    }

    /// Creates every directory of the layout; existing directories are left alone.
    pub fn bootstrap(&self, shrink: bool) -> Result<(), PortalError> {
        let mut dirs = vec![
            self.dest_root.clone(),
            self.xml_dir(),
            self.downloads_dir(),
            self.tmp_root.clone(),
        ];
        if shrink {
            dirs.push(self.shrinked_dir());
        }
        for dir in dirs {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| PortalError::Filesystem(format!("create {dir}: {err}")))?;
        }
        Ok(())
    }

    pub fn staging_file(&self, oid: &TaxonOid) -> Result<NamedTempFile, PortalError> {
        Builder::new()
            .prefix(&format!("pre_{oid}_"))
            .suffix(".tar.gz")
            .tempfile_in(self.tmp_root.as_std_path())
            .map_err(|err| PortalError::Filesystem(err.to_string()))
    }

    /// Removes the staging directory unless it is the downloads directory itself.
    pub fn teardown(&self) -> Result<(), PortalError> {
        if self.tmp_root == self.downloads_dir() {
            return Ok(());
        }
        if self.tmp_root.as_std_path().exists() {
            fs::remove_dir_all(self.tmp_root.as_std_path())
                .map_err(|err| PortalError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), PortalError> {
    let parent = path
        .parent()
        .ok_or_else(|| PortalError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| PortalError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".gpfetch-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| PortalError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| PortalError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| PortalError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Copies `source` next to `dest` first and renames it into place, so a reader
/// never sees a half-written file.
pub fn copy_file_atomic(source: &Path, dest: &Utf8Path) -> Result<(), PortalError> {
    let parent = dest
        .parent()
        .ok_or_else(|| PortalError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| PortalError::Filesystem(err.to_string()))?;
    let temp = Builder::new()
        .prefix(".gpfetch-copy")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| PortalError::Filesystem(err.to_string()))?;
    fs::copy(source, temp.path()).map_err(|err| PortalError::Filesystem(err.to_string()))?;
    temp.persist(dest.as_std_path())
        .map_err(|err| PortalError::Filesystem(err.to_string()))?;
    Ok(())
}
