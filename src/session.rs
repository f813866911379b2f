use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info};

use crate::config::Credentials;
use crate::error::PortalError;
use crate::portal::PortalClient;

/// Cookies captured from the single sign-on exchange. Immutable once created and
/// shared by reference with every later request of the run.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    cookies: BTreeMap<String, String>,
}

impl SessionToken {
    pub fn new(cookies: BTreeMap<String, String>) -> Self {
        Self { cookies }
    }

    /// A token without cookies, used for dry runs and tests.
    pub fn anonymous() -> Self {
        Self {
            cookies: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let pairs = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>();
        Some(pairs.join("; "))
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct SessionAuthenticator<'a, P: PortalClient> {
    portal: &'a P,
    signon_url: &'a str,
    cookie_domain: &'a str,
}

impl<'a, P: PortalClient> SessionAuthenticator<'a, P> {
    pub fn new(portal: &'a P, signon_url: &'a str, cookie_domain: &'a str) -> Self {
        Self {
            portal,
            signon_url,
            cookie_domain,
        }
    }

    pub fn authenticate(&self, credentials: &Credentials) -> Result<SessionToken, PortalError> {
        info!(url = self.signon_url, "signing on to portal");
        let set_cookies =
            self.portal
                .sign_on(self.signon_url, &credentials.login, &credentials.password)?;
        let mut cookies = BTreeMap::new();
        for cookie in set_cookies {
            let in_domain = cookie
                .domain
                .as_deref()
                .is_some_and(|domain| domain_matches(domain, self.cookie_domain));
            if in_domain {
                debug!(cookie = cookie.name, "captured session cookie");
                cookies.insert(cookie.name, cookie.value);
            }
        }
        if cookies.is_empty() {
            return Err(PortalError::Auth(format!(
                "no session cookie for domain {} in sign-on response",
                self.cookie_domain
            )));
        }
        Ok(SessionToken::new(cookies))
    }
}

/// One cookie set by the sign-on response. Cookies without a `Domain` attribute
/// are host-only and never become part of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
}

impl SetCookie {
    pub fn new(name: &str, value: &str, domain: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.map(str::to_string),
        }
    }
}

fn domain_matches(cookie_domain: &str, expected: &str) -> bool {
    let cookie_domain = cookie_domain.trim_start_matches('.').to_ascii_lowercase();
    let expected = expected.trim_start_matches('.').to_ascii_lowercase();
    cookie_domain == expected || cookie_domain.ends_with(&format!(".{expected}"))
}
