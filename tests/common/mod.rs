#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Mutex;

use flate2::Compression;
use flate2::write::GzEncoder;

use genomeportal_fetch::config::{PortalEndpoints, Settings};
use genomeportal_fetch::domain::{BinaryKind, ContentClass};
use genomeportal_fetch::error::PortalError;
use genomeportal_fetch::portal::{PortalClient, PortalResponse};
use genomeportal_fetch::session::{SessionToken, SetCookie};

pub fn session_cookie() -> SetCookie {
    SetCookie::new("jgi_session", "token42", Some("portal.test"))
}

pub fn endpoints() -> PortalEndpoints {
    PortalEndpoints {
        signon: "https://signon.portal.test/create".to_string(),
        listing: "https://portal.test/get-directory?organism={}".to_string(),
        project_lookup: "https://portal.test/lookup?keyName=jgiProjectId&keyValue={}".to_string(),
        download_base: "https://portal.test".to_string(),
        direct_bundle: "https://portal.test/IMG_{}/download/download_bundle.tar.gz".to_string(),
        taxon_detail: "https://img.portal.test/taxon?taxon_oid={}".to_string(),
    }
}

pub fn settings() -> Settings {
    Settings {
        endpoints: endpoints(),
        cookie_domain: Some(".portal.test".to_string()),
        timeout_secs: None,
    }
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub final_url: Option<String>,
    pub content: ContentClass,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn xml(body: &str) -> Self {
        Self {
            final_url: None,
            content: ContentClass::Xml,
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn html(body: &str) -> Self {
        Self {
            final_url: None,
            content: ContentClass::Html,
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn gzip(body: Vec<u8>) -> Self {
        Self {
            final_url: None,
            content: ContentClass::Binary(BinaryKind::Gzip),
            body,
        }
    }

    pub fn redirect(final_url: &str) -> Self {
        Self {
            final_url: Some(final_url.to_string()),
            content: ContentClass::Html,
            body: Vec::new(),
        }
    }
}

/// In-memory portal keyed by exact URL. Every request is logged in order.
#[derive(Default)]
pub struct MockPortal {
    routes: HashMap<String, Reply>,
    cookies: Vec<SetCookie>,
    requests: Mutex<Vec<String>>,
}

impl MockPortal {
    pub fn new() -> Self {
        Self {
            cookies: vec![session_cookie()],
            ..Self::default()
        }
    }

    pub fn without_cookies() -> Self {
        Self::default()
    }

    pub fn route(mut self, url: &str, reply: Reply) -> Self {
        self.routes.insert(url.to_string(), reply);
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.requests()
            .iter()
            .filter(|url| url.contains(needle))
            .count()
    }
}

impl PortalClient for MockPortal {
    fn sign_on(
        &self,
        url: &str,
        login: &str,
        _password: &str,
    ) -> Result<Vec<SetCookie>, PortalError> {
        self.requests.lock().unwrap().push(url.to_string());
        if login.is_empty() {
            return Err(PortalError::Auth("empty login".to_string()));
        }
        Ok(self.cookies.clone())
    }

    fn get(&self, url: &str, session: &SessionToken) -> Result<PortalResponse, PortalError> {
        self.requests.lock().unwrap().push(url.to_string());
        if session.get("jgi_session").is_none() {
            return Ok(PortalResponse {
                final_url: url.to_string(),
                status: 200,
                content: ContentClass::Html,
                body: Box::new(Cursor::new(b"<html>please sign in</html>".to_vec())),
            });
        }
        let reply = self
            .routes
            .get(url)
            .cloned()
            .ok_or_else(|| PortalError::PortalHttp(format!("no route for {url}")))?;
        Ok(PortalResponse {
            final_url: reply.final_url.unwrap_or_else(|| url.to_string()),
            status: 200,
            content: reply.content,
            body: Box::new(Cursor::new(reply.body)),
        })
    }
}

pub fn listing_xml(entries: &[(&str, &str)]) -> String {
    let files = entries
        .iter()
        .map(|(filename, url)| {
            format!(r#"<file label="x" filename="{filename}" url="{url}" size="1"/>"#)
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<organismDownloads name="IMG_x">
  <folder name="IMG Data">
    {files}
  </folder>
</organismDownloads>"#
    )
}

pub fn tar_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn bundle(oid: &str) -> Vec<u8> {
    let fna = format!("{oid}/{oid}.a.fna");
    let cog = format!("{oid}/{oid}.a.cog.txt");
    gzip_bytes(&tar_bytes(&[
        (fna.as_str(), b">contig\nACGT\n".as_slice()),
        (cog.as_str(), b"gene\tcog\n".as_slice()),
    ]))
}
