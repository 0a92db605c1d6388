//! HTTP transport backed by a blocking `reqwest` client.

use crate::core::sync::config::SyncConfig;
use crate::core::sync::transport::{Connector, Method, Request, Response, Transport};
use crate::{ArborError, Result};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use std::time::Duration;

/// Cookie carrying the session issued by login.
pub const SESSION_COOKIE: &str = "arbor_sync_session";

const PAGE_COUNT_HEADER: &str = "pageCount";
const PAGE_INDEX_HEADER: &str = "pageIndex";
const REQUEST_ID_HEADER: &str = "requestId";

pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Builds a client for `config`; with `use_proxy` the configured proxy is used.
    ///
    /// # Errors
    ///
    /// Returns [`ArborError::NotConfigured`] for an unusable proxy address.
    pub fn new(config: &SyncConfig, use_proxy: bool) -> Result<Self> {
        let mut builder = Client::builder().timeout(config.timeout());
        match (&config.proxy, use_proxy) {
            (Some(proxy), true) => {
                log::debug!("Routing sync through proxy {proxy}");
                let proxy = reqwest::Proxy::all(proxy.as_str())
                    .map_err(|e| ArborError::NotConfigured(format!("Invalid sync proxy {proxy}: {e}")))?;
                builder = builder.proxy(proxy);
            }
            _ => builder = builder.no_proxy(),
        }
        let client = builder
            .build()
            .map_err(|e| ArborError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.server_address.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, request: &Request) -> String {
        format!("{}{}", self.base_url, request.route.path())
    }
}

fn map_error(e: reqwest::Error) -> ArborError {
    if e.is_timeout() {
        ArborError::Timeout(e.to_string())
    } else {
        ArborError::Transport(e.to_string())
    }
}

/// Extracts the session value from one `Set-Cookie` header.
fn parse_session_cookie(header: &str) -> Option<String> {
    let pair = header.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_string())
}

impl Transport for HttpTransport {
    fn execute(&mut self, request: &Request, timeout: Duration) -> Result<Response> {
        let method = match request.route.method() {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
        };
        let mut builder = self.client.request(method, self.url(request)).timeout(timeout);

        if let Some(session) = &request.session {
            builder = builder.header(COOKIE, format!("{SESSION_COOKIE}={session}"));
        }
        if let Some(page) = &request.page {
            builder = builder
                .header(PAGE_COUNT_HEADER, page.page_count.to_string())
                .header(PAGE_INDEX_HEADER, page.page_index.to_string())
                .header(REQUEST_ID_HEADER, page.request_id.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.header(CONTENT_TYPE, "application/json").body(body.clone());
        }

        let response = builder.send().map_err(map_error)?;
        let status = response.status().as_u16();
        let session = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(parse_session_cookie);
        let body = response.text().map_err(map_error)?;

        Ok(Response { status, body, session })
    }
}

/// Opens an [`HttpTransport`] per attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn connect(&self, config: &SyncConfig, use_proxy: bool) -> Result<Box<dyn Transport>> {
        Ok(Box::new(HttpTransport::new(config, use_proxy)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sync::transport::Route;

    #[test]
    fn test_parse_session_cookie() {
        assert_eq!(
            parse_session_cookie("arbor_sync_session=abc123; Path=/; HttpOnly").as_deref(),
            Some("abc123")
        );
        assert_eq!(parse_session_cookie("other=1; Path=/"), None);
        assert_eq!(parse_session_cookie("arbor_sync_session=; Path=/"), None);
    }

    #[test]
    fn test_url_joins_base_and_route() {
        let transport = HttpTransport::new(&SyncConfig::for_server("http://peer:8080/"), false).unwrap();
        assert_eq!(
            transport.url(&Request::new(Route::CheckHashes)),
            "http://peer:8080/api/sync/check"
        );
    }

    #[test]
    fn test_invalid_proxy_is_a_configuration_error() {
        let config = SyncConfig {
            proxy: Some("http://[invalid".to_string()),
            ..SyncConfig::for_server("http://peer:8080")
        };
        assert!(matches!(HttpTransport::new(&config, true), Err(ArborError::NotConfigured(_))));
        assert!(HttpTransport::new(&config, false).is_ok());
    }

    #[test]
    fn test_refused_connection_is_a_transport_error() {
        let mut transport = HttpTransport::new(&SyncConfig::for_server("http://127.0.0.1:1"), false).unwrap();
        let result = transport.execute(&Request::new(Route::CheckHashes), Duration::from_secs(5));
        assert!(matches!(result, Err(ArborError::Transport(_)) | Err(ArborError::Timeout(_))));
    }
}
