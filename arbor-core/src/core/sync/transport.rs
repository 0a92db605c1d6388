//! Request/response plumbing between the sync driver and its peer.
//!
//! A [`Transport`] moves one [`Request`] and returns the raw [`Response`].
//! [`SyncClient`] sits on top of it and owns everything an attempt needs on
//! the wire: the session credential from login, splitting oversized push
//! bodies into pages, the attempt deadline, and mapping status codes onto
//! [`ArborError`].

use crate::core::apply::ApplyReport;
use crate::core::entity::EntityKind;
use crate::core::sync::config::SyncConfig;
use crate::core::sync::protocol::{
    HashCheckResponse, LoginRequest, LoginResponse, PullResponse, PushRequest, QueueSectorResponse,
};
use crate::{ArborError, Result};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

/// Default size of one page of a paged push, in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

/// The six operations a peer answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Login,
    PullChanges { since: i64, instance_id: String },
    PushChanges,
    CheckHashes,
    FinishCycle,
    QueueSector { entity_type: EntityKind, sector: String },
}

impl Route {
    pub fn method(&self) -> Method {
        match self {
            Self::Login | Self::FinishCycle | Self::QueueSector { .. } => Method::Post,
            Self::PullChanges { .. } | Self::CheckHashes => Method::Get,
            Self::PushChanges => Method::Put,
        }
    }

    /// Path and query relative to the peer's base address.
    pub fn path(&self) -> String {
        match self {
            Self::Login => "/api/login/sync".to_string(),
            Self::PullChanges { since, instance_id } => {
                format!(
                    "/api/sync/changed?lastEntityChangeId={since}&instanceId={}",
                    encode_component(instance_id)
                )
            }
            Self::PushChanges => "/api/sync/update".to_string(),
            Self::CheckHashes => "/api/sync/check".to_string(),
            Self::FinishCycle => "/api/sync/finished".to_string(),
            Self::QueueSector { entity_type, sector } => {
                format!("/api/sync/queue-sector/{entity_type}/{}", encode_component(sector))
            }
        }
    }

    /// Whether the peer demands a session from login.
    pub fn needs_session(&self) -> bool {
        !matches!(self, Self::Login)
    }
}

/// Percent-encodes one path segment or query value.
fn encode_component(value: &str) -> String {
    // byte_serialize writes spaces as '+' and a literal '+' as %2B
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Position of one page within a paged request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    /// Shared by every page of one request.
    pub request_id: String,
    pub page_index: usize,
    pub page_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub route: Route,
    /// JSON body, or one page of it.
    pub body: Option<String>,
    pub session: Option<String>,
    pub page: Option<PageInfo>,
}

impl Request {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            body: None,
            session: None,
            page: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP-style status code.
    pub status: u16,
    pub body: String,
    /// Session credential issued by login.
    pub session: Option<String>,
}

impl Response {
    pub fn ok(body: String) -> Self {
        Self {
            status: 200,
            body,
            session: None,
        }
    }

    pub fn accepted() -> Self {
        Self {
            status: 202,
            body: String::new(),
            session: None,
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: message.into(),
            session: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Moves requests to the peer.
pub trait Transport: Send {
    /// Executes one round trip, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ArborError::Transport`] if the peer cannot be reached and
    /// [`ArborError::Timeout`] if it does not answer in time. Non-success
    /// statuses are returned as a [`Response`], not as errors.
    fn execute(&mut self, request: &Request, timeout: Duration) -> Result<Response>;
}

/// Opens a [`Transport`] for one sync attempt.
pub trait Connector: Send + Sync {
    /// `use_proxy` asks for the configured proxy, if any, to be used.
    fn connect(&self, config: &SyncConfig, use_proxy: bool) -> Result<Box<dyn Transport>>;
}

/// Splits `body` into pages of at most `page_size` bytes, never inside a character.
///
/// A character straddling a page boundary moves whole into the next page.
pub fn split_pages(body: &str, page_size: usize) -> Vec<&str> {
    if body.len() <= page_size {
        return vec![body];
    }
    let mut pages = Vec::with_capacity(body.len() / page_size.max(1) + 1);
    let mut start = 0;
    while start < body.len() {
        let mut end = (start + page_size).min(body.len());
        while end > start && !body.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // A single character larger than a page.
            end = start + 1;
            while !body.is_char_boundary(end) {
                end += 1;
            }
        }
        pages.push(&body[start..end]);
        start = end;
    }
    pages
}

fn status_error(response: &Response, route: &Route) -> ArborError {
    let detail = if response.body.is_empty() {
        format!("{} {} answered {}", route.method().as_str(), route.path(), response.status)
    } else {
        response.body.clone()
    };
    match response.status {
        401 | 403 => ArborError::Unauthorized(detail),
        502..=504 => ArborError::Transport(detail),
        _ => ArborError::Protocol(format!("status {}: {detail}", response.status)),
    }
}

/// Typed client for one sync attempt.
pub struct SyncClient {
    transport: Box<dyn Transport>,
    session: Option<String>,
    deadline: Instant,
    page_size: usize,
}

impl SyncClient {
    /// Every round trip after `deadline` fails with [`ArborError::Timeout`].
    pub fn new(transport: Box<dyn Transport>, deadline: Instant) -> Self {
        Self {
            transport,
            session: None,
            deadline,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn send(&mut self, route: Route, body: Option<String>, page: Option<PageInfo>) -> Result<Response> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ArborError::Timeout(format!(
                "Sync attempt ran out of time before {}",
                route.path()
            )));
        }
        if route.needs_session() && self.session.is_none() {
            return Err(ArborError::Unauthorized("No sync session; log in first".to_string()));
        }

        let request = Request {
            route,
            body,
            session: self.session.clone(),
            page,
        };
        let response = self.transport.execute(&request, remaining)?;
        if !response.is_success() {
            return Err(status_error(&response, &request.route));
        }
        Ok(response)
    }

    fn call<T: DeserializeOwned>(&mut self, route: Route, body: Option<String>) -> Result<T> {
        let response = self.send(route, body, None)?;
        Ok(serde_json::from_str(&response.body)?)
    }

    /// Logs in and keeps the issued session for every later call.
    pub fn login(&mut self, request: &LoginRequest) -> Result<LoginResponse> {
        let response = self.send(Route::Login, Some(serde_json::to_string(request)?), None)?;
        self.session = Some(
            response
                .session
                .ok_or_else(|| ArborError::Protocol("Login answer carried no session".to_string()))?,
        );
        Ok(serde_json::from_str(&response.body)?)
    }

    pub fn pull_changes(&mut self, since: i64, instance_id: &str) -> Result<PullResponse> {
        self.call(
            Route::PullChanges {
                since,
                instance_id: instance_id.to_string(),
            },
            None,
        )
    }

    /// Sends a push, paged when the body exceeds the page size.
    pub fn push_changes(&mut self, request: &PushRequest) -> Result<ApplyReport> {
        let body = serde_json::to_string(request)?;
        if body.len() <= self.page_size {
            return self.call(Route::PushChanges, Some(body));
        }

        let pages = split_pages(&body, self.page_size);
        let page_count = pages.len();
        let request_id = uuid::Uuid::new_v4().to_string();
        log::debug!("Pushing {} bytes in {page_count} pages as request {request_id}", body.len());

        let mut last = None;
        for (page_index, page) in pages.into_iter().enumerate() {
            let info = PageInfo {
                request_id: request_id.clone(),
                page_index,
                page_count,
            };
            last = Some(self.send(Route::PushChanges, Some(page.to_string()), Some(info))?);
        }
        let last = last.ok_or_else(|| ArborError::Protocol("Paged push sent no pages".to_string()))?;
        Ok(serde_json::from_str(&last.body)?)
    }

    pub fn check_hashes(&mut self) -> Result<HashCheckResponse> {
        self.call(Route::CheckHashes, None)
    }

    pub fn finish_cycle(&mut self) -> Result<()> {
        self.send(Route::FinishCycle, None, None)?;
        Ok(())
    }

    /// Asks the peer to re-send one sector.
    pub fn queue_sector(&mut self, entity_type: EntityKind, sector: &str) -> Result<usize> {
        let response: QueueSectorResponse = self.call(
            Route::QueueSector {
                entity_type,
                sector: sector.to_string(),
            },
            None,
        )?;
        Ok(response.requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records requests and answers each with the next canned response.
    struct Scripted {
        seen: Arc<Mutex<Vec<Request>>>,
        answers: Vec<Response>,
    }

    impl Transport for Scripted {
        fn execute(&mut self, request: &Request, _timeout: Duration) -> Result<Response> {
            self.seen.lock().unwrap().push(request.clone());
            if self.answers.is_empty() {
                return Err(ArborError::Transport("connection refused".to_string()));
            }
            Ok(self.answers.remove(0))
        }
    }

    fn client(answers: Vec<Response>) -> (SyncClient, Arc<Mutex<Vec<Request>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transport = Scripted {
            seen: Arc::clone(&seen),
            answers,
        };
        let deadline = Instant::now() + Duration::from_secs(60);
        (SyncClient::new(Box::new(transport), deadline), seen)
    }

    fn login_answer() -> Response {
        Response {
            status: 200,
            body: r#"{"instanceId":"inst-peer","maxSequenceId":3}"#.to_string(),
            session: Some("tok".to_string()),
        }
    }

    fn login(client: &mut SyncClient) {
        let request = crate::core::sync::protocol::login_request("s", chrono::Utc::now()).unwrap();
        client.login(&request).unwrap();
    }

    #[test]
    fn test_routes_map_to_http() {
        let pull = Route::PullChanges {
            since: 7,
            instance_id: "inst-a".to_string(),
        };
        assert_eq!(pull.method(), Method::Get);
        assert_eq!(pull.path(), "/api/sync/changed?lastEntityChangeId=7&instanceId=inst-a");
        let queue = Route::QueueSector {
            entity_type: EntityKind::Attribute,
            sector: "k".to_string(),
        };
        assert_eq!(queue.path(), "/api/sync/queue-sector/attribute/k");
        assert_eq!(Route::PushChanges.method(), Method::Put);
    }

    #[test]
    fn test_route_segments_are_percent_encoded() {
        let pull = Route::PullChanges {
            since: 1,
            instance_id: "inst a&b=c".to_string(),
        };
        assert_eq!(pull.path(), "/api/sync/changed?lastEntityChangeId=1&instanceId=inst%20a%26b%3Dc");
        for (sector, encoded) in [("/", "%2F"), ("?", "%3F"), ("#", "%23"), ("+", "%2B"), ("é", "%C3%A9")] {
            let queue = Route::QueueSector {
                entity_type: EntityKind::Note,
                sector: sector.to_string(),
            };
            assert_eq!(queue.path(), format!("/api/sync/queue-sector/note/{encoded}"));
        }
    }

    #[test]
    fn test_split_pages_respects_char_boundaries() {
        let body = "aé€b".repeat(50);
        let pages = split_pages(&body, 7);
        assert!(pages.len() > 1);
        assert_eq!(pages.concat(), body);
        assert!(pages.iter().all(|p| p.len() <= 7));
        assert_eq!(split_pages("€", 1), vec!["€"]);
        assert_eq!(split_pages("short", 100), vec!["short"]);
    }

    #[test]
    fn test_session_is_carried_after_login() {
        let (mut client, seen) = client(vec![login_answer(), Response::ok(String::new())]);
        assert!(matches!(client.finish_cycle(), Err(ArborError::Unauthorized(_))));

        login(&mut client);
        assert!(client.has_session());
        client.finish_cycle().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].session, None);
        assert_eq!(seen[1].session.as_deref(), Some("tok"));
    }

    #[test]
    fn test_status_codes_map_to_errors() {
        let (mut client, _) = client(vec![
            login_answer(),
            Response::error(401, "expired"),
            Response::error(400, "bad"),
            Response::error(503, ""),
        ]);
        login(&mut client);
        assert!(matches!(client.check_hashes(), Err(ArborError::Unauthorized(_))));
        assert!(matches!(client.check_hashes(), Err(ArborError::Protocol(_))));
        assert!(matches!(client.check_hashes(), Err(ArborError::Transport(_))));
        assert!(matches!(client.check_hashes(), Err(ArborError::Transport(_))));
    }

    #[test]
    fn test_expired_deadline_times_out_without_sending() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transport = Scripted {
            seen: Arc::clone(&seen),
            answers: vec![login_answer()],
        };
        let mut client = SyncClient::new(Box::new(transport), Instant::now());
        let request = crate::core::sync::protocol::login_request("s", chrono::Utc::now()).unwrap();
        assert!(matches!(client.login(&request), Err(ArborError::Timeout(_))));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_large_push_is_paged_with_shared_request_id() {
        let request = PushRequest {
            entities: Vec::new(),
            origin_instance_id: "inst-with-a-rather-long-identifier".to_string(),
        };
        let page_count = split_pages(&serde_json::to_string(&request).unwrap(), 16).len();
        assert!(page_count > 1);

        let mut answers = vec![login_answer()];
        answers.extend((1..page_count).map(|_| Response::accepted()));
        answers.push(Response::ok(r#"{"applied":0,"ignored":0,"skipped":0}"#.to_string()));
        let (client, seen) = client(answers);
        let mut client = client.with_page_size(16);
        login(&mut client);

        assert_eq!(client.push_changes(&request).unwrap(), ApplyReport::default());

        let seen = seen.lock().unwrap();
        let pushes: Vec<&Request> = seen.iter().filter(|r| r.route == Route::PushChanges).collect();
        assert_eq!(pushes.len(), page_count);
        let id = &pushes[0].page.as_ref().unwrap().request_id;
        for (i, request) in pushes.iter().enumerate() {
            let page = request.page.as_ref().unwrap();
            assert_eq!(&page.request_id, id);
            assert_eq!(page.page_index, i);
            assert_eq!(page.page_count, page_count);
        }
    }
}
