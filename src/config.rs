use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{Identifier, ProjectId, ShardStrategy, TaxonOid};
use crate::error::PortalError;

pub const DEFAULT_CONNECTION_LIMIT: usize = 5;
pub const DEFAULT_COOKIE_DOMAIN: &str = ".jgi.doe.gov";

/// Portal endpoint templates. `{}` is replaced by the identifier being looked up.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PortalEndpoints {
    pub signon: String,
    pub listing: String,
    pub project_lookup: String,
    pub download_base: String,
    pub direct_bundle: String,
    pub taxon_detail: String,
}

impl Default for PortalEndpoints {
    fn default() -> Self {
        Self {
            signon: "https://signon.jgi.doe.gov/signon/create".to_string(),
            listing: "https://genome.jgi.doe.gov/ext-api/downloads/get-directory?organism={}"
                .to_string(),
            project_lookup: "https://genome.jgi.doe.gov/lookup?keyName=jgiProjectId&keyValue={}"
                .to_string(),
            download_base: "https://genome.jgi.doe.gov".to_string(),
            direct_bundle: "https://genome.jgi.doe.gov/IMG_{}/download/download_bundle.tar.gz"
                .to_string(),
            taxon_detail: "https://img.jgi.doe.gov/cgi-bin/m/main.cgi?section=TaxonDetail&page=taxonDetail&taxon_oid={}"
                .to_string(),
        }
    }
}

impl PortalEndpoints {
    pub fn listing_url(&self, organism: &str) -> String {
        fill(&self.listing, organism)
    }

    pub fn project_lookup_url(&self, project: &ProjectId) -> String {
        fill(&self.project_lookup, project.as_str())
    }

    pub fn direct_bundle_url(&self, oid: &TaxonOid) -> String {
        fill(&self.direct_bundle, oid.as_str())
    }

    pub fn taxon_detail_url(&self, oid: &TaxonOid) -> String {
        fill(&self.taxon_detail, oid.as_str())
    }

    /// Joins a listing-relative URL (usually `/path/file.tar.gz`) to the download base.
    pub fn download_url(&self, located: &str) -> String {
        if located.starts_with("http://") || located.starts_with("https://") {
            return located.to_string();
        }
        format!(
            "{}/{}",
            self.download_base.trim_end_matches('/'),
            located.trim_start_matches('/')
        )
    }
}

fn fill(template: &str, value: &str) -> String {
    template.replace("{}", value)
}

/// Optional JSON settings file overriding the portal endpoints.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub endpoints: PortalEndpoints,
    #[serde(default)]
    pub cookie_domain: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Settings {
    pub fn cookie_domain(&self) -> &str {
        self.cookie_domain.as_deref().unwrap_or(DEFAULT_COOKIE_DOMAIN)
    }
}

pub struct SettingsLoader;

impl SettingsLoader {
    pub fn resolve(path: Option<&Path>) -> Result<Settings, PortalError> {
        let Some(path) = path else {
            return Ok(Settings::default());
        };
        let content = fs::read_to_string(path)
            .map_err(|_| PortalError::SettingsRead(path.to_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| PortalError::SettingsParse(err.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    /// Reads the login from the first line and the password from the second.
    pub fn load(path: &Path) -> Result<Self, PortalError> {
        if !path.exists() {
            return Err(PortalError::MissingCredentials(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)
            .map_err(|_| PortalError::InvalidCredentials(path.to_path_buf()))?;
        let mut lines = content.lines().map(str::trim);
        let login = lines.next().unwrap_or_default();
        let password = lines.next().unwrap_or_default();
        if login.is_empty() || password.is_empty() {
            return Err(PortalError::InvalidCredentials(path.to_path_buf()));
        }
        Ok(Self {
            login: login.to_string(),
            password: password.to_string(),
        })
    }
}

/// Flags controlling which archive members the transformer deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExclusionPolicy {
    pub remove_unassembled: bool,
    pub keep_unassembled_if_none_assembled: bool,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub identifiers: Vec<Identifier>,
    pub project_field: Option<usize>,
    pub dest_dir: Utf8PathBuf,
    pub tmp_dir: Option<Utf8PathBuf>,
    pub connection_limit: usize,
    pub download: bool,
    pub shrink: bool,
    pub exclusion: ExclusionPolicy,
    pub listing_dir: Option<Utf8PathBuf>,
    pub shard_strategy: ShardStrategy,
    pub direct: bool,
    pub resume: bool,
    pub dry_run: bool,
}

impl RunConfig {
    pub fn new(identifiers: Vec<Identifier>, dest_dir: Utf8PathBuf) -> Self {
        Self {
            identifiers,
            project_field: None,
            dest_dir,
            tmp_dir: None,
            connection_limit: DEFAULT_CONNECTION_LIMIT,
            download: false,
            shrink: false,
            exclusion: ExclusionPolicy::default(),
            listing_dir: None,
            shard_strategy: ShardStrategy::RoundRobin,
            direct: false,
            resume: false,
            dry_run: false,
        }
    }

    pub fn validate(&self) -> Result<(), PortalError> {
        if self.connection_limit == 0 {
            return Err(PortalError::InvalidConfig(
                "connection limit must be at least 1".to_string(),
            ));
        }
        if self.dest_dir.as_str().is_empty() {
            return Err(PortalError::InvalidConfig(
                "destination directory must not be empty".to_string(),
            ));
        }
        if self.direct && self.listing_dir.is_some() {
            return Err(PortalError::InvalidConfig(
                "direct downloads do not read a listing directory".to_string(),
            ));
        }
        if let Some(dir) = &self.listing_dir {
            if !dir.as_std_path().is_dir() {
                return Err(PortalError::MissingListingDir(dir.as_std_path().to_path_buf()));
            }
        }
        Ok(())
    }
}

/// Loads the tab-separated identifier list ("genome cart").
pub fn load_identifiers(
    path: &Path,
    skip_header: bool,
    project_field: Option<usize>,
) -> Result<Vec<Identifier>, PortalError> {
    let content = fs::read_to_string(path)
        .map_err(|_| PortalError::IdentifierRead(PathBuf::from(path)))?;
    parse_identifiers(&content, skip_header, project_field)
}

pub fn parse_identifiers(
    content: &str,
    skip_header: bool,
    project_field: Option<usize>,
) -> Result<Vec<Identifier>, PortalError> {
    let mut identifiers = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if skip_header && index == 0 {
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        let columns = line.trim_end_matches(['\r', '\n']).split('\t').collect::<Vec<_>>();
        let line_no = index + 1;
        let oid = columns[0]
            .parse::<TaxonOid>()
            .map_err(|err| PortalError::IdentifierParse {
                line: line_no,
                message: err.to_string(),
            })?;
        let identifier = match project_field {
            Some(field) => {
                let raw = columns.get(field).ok_or_else(|| PortalError::IdentifierParse {
                    line: line_no,
                    message: format!("missing project id column {field}"),
                })?;
                let project = raw
                    .parse::<ProjectId>()
                    .map_err(|err| PortalError::IdentifierParse {
                        line: line_no,
                        message: err.to_string(),
                    })?;
                Identifier::with_project(oid, project)
            }
            None => Identifier::new(oid),
        };
        identifiers.push(identifier);
    }
    Ok(identifiers)
}
