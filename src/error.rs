use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PortalError {
    #[error("invalid taxon OID: {0}")]
    InvalidOid(String),

    #[error("credentials file does not exist: {0}")]
    MissingCredentials(PathBuf),

    #[error("credentials file {0} must contain the login on line 1 and the password on line 2")]
    InvalidCredentials(PathBuf),

    #[error("failed to read identifier file at {0}")]
    IdentifierRead(PathBuf),

    #[error("identifier file line {line}: {message}")]
    IdentifierParse { line: usize, message: String },

    #[error("specified XML directory does not exist: {0}")]
    MissingListingDir(PathBuf),

    #[error("failed to read settings file at {0}")]
    SettingsRead(PathBuf),

    #[error("failed to parse JSON settings: {0}")]
    SettingsParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sign-on failed: {0}")]
    Auth(String),

    #[error("portal request failed: {0}")]
    PortalHttp(String),

    #[error("failed to parse listing document: {0}")]
    ListingParse(String),

    #[error("no listing document for {0}")]
    Resolution(String),

    #[error("listing for {0} has no downloadable bundle")]
    UnresolvedLocation(String),

    #[error("download of {id} did not yield an archive: {reason}")]
    Download { id: String, reason: String },

    #[error("archive transform failed: {0}")]
    Transform(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl PortalError {
    /// Errors raised before any shard is scheduled; these abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PortalError::MissingCredentials(_)
                | PortalError::InvalidCredentials(_)
                | PortalError::IdentifierRead(_)
                | PortalError::IdentifierParse { .. }
                | PortalError::MissingListingDir(_)
                | PortalError::SettingsRead(_)
                | PortalError::SettingsParse(_)
                | PortalError::InvalidConfig(_)
                | PortalError::Auth(_)
        )
    }
}
