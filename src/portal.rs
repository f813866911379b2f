use std::io::{self, Read, Write};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::redirect::Policy;
use tracing::debug;

use crate::domain::ContentClass;
use crate::error::PortalError;
use crate::session::{SessionToken, SetCookie};

pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// A portal response whose body has not been read yet.
pub struct PortalResponse {
    pub final_url: String,
    pub status: u16,
    pub content: ContentClass,
    pub body: Box<dyn Read + Send>,
}

impl PortalResponse {
    pub fn bytes(mut self) -> Result<Vec<u8>, PortalError> {
        let mut buf = Vec::new();
        self.body
            .read_to_end(&mut buf)
            .map_err(|err| PortalError::PortalHttp(err.to_string()))?;
        Ok(buf)
    }

    pub fn text(self) -> Result<String, PortalError> {
        let bytes = self.bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn copy_to(mut self, writer: &mut dyn Write) -> Result<u64, PortalError> {
        io::copy(&mut self.body, writer).map_err(|err| PortalError::PortalHttp(err.to_string()))
    }

    /// Text after the last `=` of the final URL, which is where the project
    /// lookup redirect encodes the canonical organism name.
    pub fn redirect_name(&self) -> Option<&str> {
        self.final_url
            .rsplit_once('=')
            .map(|(_, name)| name)
            .filter(|name| !name.is_empty())
    }
}

pub trait PortalClient: Send + Sync {
    /// Posts the credentials and returns the cookies set by the response.
    fn sign_on(
        &self,
        url: &str,
        login: &str,
        password: &str,
    ) -> Result<Vec<SetCookie>, PortalError>;
    fn get(&self, url: &str, session: &SessionToken) -> Result<PortalResponse, PortalError>;
}

#[derive(Clone)]
pub struct PortalHttpClient {
    client: Client,
    signon_client: Client,
}

impl PortalHttpClient {
    pub fn new(timeout_secs: Option<u64>) -> Result<Self, PortalError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("gpfetch/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PortalError::PortalHttp(err.to_string()))?,
        );
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(timeout)
            .build()
            .map_err(|err| PortalError::PortalHttp(err.to_string()))?;
        // The sign-on response redirects; its cookies are only visible without following it.
        let signon_client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .redirect(Policy::none())
            .build()
            .map_err(|err| PortalError::PortalHttp(err.to_string()))?;

        Ok(Self {
            client,
            signon_client,
        })
    }
}

impl PortalClient for PortalHttpClient {
    fn sign_on(
        &self,
        url: &str,
        login: &str,
        password: &str,
    ) -> Result<Vec<SetCookie>, PortalError> {
        let response = self
            .signon_client
            .post(url)
            .form(&[("login", login), ("password", password)])
            .send()
            .map_err(|err| PortalError::Auth(err.to_string()))?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(PortalError::Auth(format!("sign-on returned status {status}")));
        }
        Ok(response
            .cookies()
            .map(|cookie| SetCookie::new(cookie.name(), cookie.value(), cookie.domain()))
            .collect())
    }

    fn get(&self, url: &str, session: &SessionToken) -> Result<PortalResponse, PortalError> {
        debug!(url, "portal request");
        let mut request = self.client.get(url);
        if let Some(cookie) = session.cookie_header() {
            request = request.header(COOKIE, cookie);
        }
        let response = request
            .send()
            .map_err(|err| PortalError::PortalHttp(err.to_string()))?;
        let content = ContentClass::from_content_type(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
        );
        Ok(PortalResponse {
            final_url: response.url().to_string(),
            status: response.status().as_u16(),
            content,
            body: Box::new(response),
        })
    }
}
