mod common;

use assert_matches::assert_matches;

use genomeportal_fetch::config::Credentials;
use genomeportal_fetch::error::PortalError;
use genomeportal_fetch::portal::{PortalClient, PortalResponse};
use genomeportal_fetch::session::{SessionAuthenticator, SessionToken, SetCookie};

struct CookieJar(Vec<SetCookie>);

impl PortalClient for CookieJar {
    fn sign_on(
        &self,
        _url: &str,
        _login: &str,
        _password: &str,
    ) -> Result<Vec<SetCookie>, PortalError> {
        Ok(self.0.clone())
    }

    fn get(&self, url: &str, _session: &SessionToken) -> Result<PortalResponse, PortalError> {
        Err(PortalError::PortalHttp(format!("unexpected request to {url}")))
    }
}

fn credentials() -> Credentials {
    Credentials {
        login: "user@example.org".to_string(),
        password: "secret".to_string(),
    }
}

#[test]
fn keeps_only_cookies_of_the_portal_domain() {
    let portal = CookieJar(vec![
        SetCookie::new("jgi_session", "abc", Some("jgi.doe.gov")),
        SetCookie::new("tracker", "xyz", Some("ads.example.com")),
        SetCookie::new("signon_pref", "1", Some("signon.jgi.doe.gov")),
        SetCookie::new("hostonly", "1", None),
    ]);
    let authenticator = SessionAuthenticator::new(
        &portal,
        "https://signon.jgi.doe.gov/signon/create",
        ".jgi.doe.gov",
    );
    let token = authenticator.authenticate(&credentials()).unwrap();

    assert_eq!(token.get("jgi_session"), Some("abc"));
    assert_eq!(token.get("signon_pref"), Some("1"));
    assert_eq!(token.get("tracker"), None);
    assert_eq!(token.get("hostonly"), None);
    assert_eq!(
        token.cookie_header().as_deref(),
        Some("jgi_session=abc; signon_pref=1")
    );
}

#[test]
fn no_matching_cookie_is_an_auth_error() {
    let portal = CookieJar(vec![SetCookie::new("tracker", "xyz", Some("example.com"))]);
    let result = SessionAuthenticator::new(&portal, "https://signon.test", ".jgi.doe.gov")
        .authenticate(&credentials());
    assert_matches!(result, Err(PortalError::Auth(_)));
}

#[test]
fn mock_portal_sign_on() {
    let portal = common::MockPortal::new();
    let authenticator =
        SessionAuthenticator::new(&portal, "https://signon.portal.test/create", ".portal.test");
    let token = authenticator.authenticate(&credentials()).unwrap();
    assert_eq!(token.get("jgi_session"), Some("token42"));
    assert_eq!(portal.requests(), vec!["https://signon.portal.test/create"]);
}
