//! The answering side of every sync operation.
//!
//! [`SyncHandler`] serves one replica to a peer. It is transport-agnostic:
//! an HTTP server would decode requests into [`Request`] and hand them to
//! [`SyncHandler::handle`], and [`LoopbackTransport`] does the same in process.

use crate::core::apply::ApplyReport;
use crate::core::entity::EntityKind;
use crate::core::entity_change::CHANGE_BATCH_SIZE;
use crate::core::replica::Replica;
use crate::core::sync::config::SyncConfig;
use crate::core::sync::pages::PageAssembler;
use crate::core::sync::protocol::{
    verify_login, HashCheckResponse, LoginRequest, LoginResponse, PullResponse, PushRequest,
    QueueSectorResponse,
};
use crate::core::sync::transport::{Connector, Request, Response, Route, Transport};
use crate::{ArborError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Sessions idle for this long are forgotten; the client logs in again.
pub const SESSION_EXPIRY: Duration = Duration::from_secs(20 * 60);

/// Serves one replica to its peer.
pub struct SyncHandler {
    replica: Arc<Mutex<Replica>>,
    sessions: Mutex<HashMap<String, Instant>>,
    session_expiry: Duration,
    pages: Mutex<PageAssembler>,
}

impl SyncHandler {
    pub fn new(replica: Arc<Mutex<Replica>>) -> Self {
        Self {
            replica,
            sessions: Mutex::new(HashMap::new()),
            session_expiry: SESSION_EXPIRY,
            pages: Mutex::new(PageAssembler::new()),
        }
    }

    #[must_use]
    pub fn with_session_expiry(mut self, expiry: Duration) -> Self {
        self.session_expiry = expiry;
        self
    }

    /// Number of sessions currently held open.
    pub fn open_sessions(&self) -> usize {
        self.lock_sessions().len()
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refreshes `token` if it names a live session.
    fn touch_session(&self, token: &str, now: Instant) -> bool {
        let mut sessions = self.lock_sessions();
        match sessions.get_mut(token) {
            Some(last_seen) if now.saturating_duration_since(*last_seen) <= self.session_expiry => {
                *last_seen = now;
                true
            }
            Some(_) => {
                sessions.remove(token);
                false
            }
            None => false,
        }
    }

    /// Drops sessions idle for longer than the expiry window.
    pub fn evict_stale_sessions(&self, now: Instant) -> usize {
        let expiry = self.session_expiry;
        let mut sessions = self.lock_sessions();
        let before = sessions.len();
        sessions.retain(|_, last_seen| now.saturating_duration_since(*last_seen) <= expiry);
        let evicted = before - sessions.len();
        if evicted > 0 {
            log::debug!("Expired {evicted} idle sync sessions");
        }
        evicted
    }

    /// The served replica.
    pub fn replica(&self) -> &Arc<Mutex<Replica>> {
        &self.replica
    }

    fn lock_replica(&self) -> MutexGuard<'_, Replica> {
        self.replica.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers one request; failures become error statuses.
    pub fn handle(&self, request: &Request) -> Response {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Sync request {} failed: {e}", request.route.path());
                Response::error(status_for(&e), e.to_string())
            }
        }
    }

    fn dispatch(&self, request: &Request) -> Result<Response> {
        if request.route.needs_session() {
            let known = match &request.session {
                Some(token) => self.touch_session(token, Instant::now()),
                None => false,
            };
            if !known {
                return Err(ArborError::Unauthorized("Unknown or missing sync session".to_string()));
            }
        }

        match &request.route {
            Route::Login => {
                let login: LoginRequest = serde_json::from_str(body(request)?)?;
                let (answer, session) = self.login(&login)?;
                let mut response = Response::ok(serde_json::to_string(&answer)?);
                response.session = Some(session);
                Ok(response)
            }
            Route::PullChanges { since, instance_id } => {
                Ok(Response::ok(serde_json::to_string(&self.pull_changes(*since, instance_id)?)?))
            }
            Route::PushChanges => {
                let body = match &request.page {
                    Some(page) => {
                        let assembled = self
                            .pages
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .accept(page, body(request)?.to_string())?;
                        match assembled {
                            Some(body) => body,
                            None => return Ok(Response::accepted()),
                        }
                    }
                    None => body(request)?.to_string(),
                };
                let push: PushRequest = serde_json::from_str(&body)?;
                Ok(Response::ok(serde_json::to_string(&self.push_changes(&push)?)?))
            }
            Route::CheckHashes => Ok(Response::ok(serde_json::to_string(&self.check_hashes()?)?)),
            Route::FinishCycle => {
                self.finish_cycle()?;
                Ok(Response::ok(String::new()))
            }
            Route::QueueSector { entity_type, sector } => {
                let requeued = self.queue_sector(*entity_type, sector)?;
                Ok(Response::ok(serde_json::to_string(&QueueSectorResponse { requeued })?))
            }
        }
    }

    /// Verifies a login and opens a session.
    pub fn login(&self, request: &LoginRequest) -> Result<(LoginResponse, String)> {
        let replica = self.lock_replica();
        verify_login(&replica.document_secret()?, request, chrono::Utc::now())?;

        let now = Instant::now();
        self.evict_stale_sessions(now);
        let session = uuid::Uuid::new_v4().to_string();
        self.lock_sessions().insert(session.clone(), now);
        Ok((
            LoginResponse {
                instance_id: replica.instance_id().to_string(),
                max_sequence_id: replica.max_sequence_id()?,
            },
            session,
        ))
    }

    /// Returns the next batch after `since`, leaving out the requester's own changes.
    pub fn pull_changes(&self, since: i64, requester_instance_id: &str) -> Result<PullResponse> {
        let replica = self.lock_replica();
        let outgoing = replica.change_log().outgoing(
            replica.connection(),
            since,
            Some(requester_instance_id),
            CHANGE_BATCH_SIZE,
        )?;
        log::debug!(
            "Serving {} changes after {since} to {requester_instance_id}, {} outstanding",
            outgoing.records.len(),
            outgoing.outstanding_count
        );
        Ok(PullResponse {
            changes: outgoing.records,
            last_sequence_id: outgoing.last_sequence_id,
            outstanding_count: outgoing.outstanding_count,
        })
    }

    /// Applies a complete pushed batch in one transaction.
    pub fn push_changes(&self, request: &PushRequest) -> Result<ApplyReport> {
        let mut replica = self.lock_replica();
        if request.origin_instance_id == replica.instance_id() {
            return Err(ArborError::SelfSync(request.origin_instance_id.clone()));
        }
        replica.apply_pushed(&request.entities)
    }

    pub fn check_hashes(&self) -> Result<HashCheckResponse> {
        let replica = self.lock_replica();
        Ok(HashCheckResponse {
            sector_hashes: replica.sector_hashes()?,
            max_sequence_id: replica.max_sequence_id()?,
        })
    }

    pub fn finish_cycle(&self) -> Result<()> {
        self.lock_replica().mark_bootstrap_complete()
    }

    pub fn queue_sector(&self, entity_type: EntityKind, sector: &str) -> Result<usize> {
        self.lock_replica().requeue_sector(entity_type, sector)
    }
}

fn body(request: &Request) -> Result<&str> {
    request
        .body
        .as_deref()
        .ok_or_else(|| ArborError::Protocol(format!("{} needs a body", request.route.path())))
}

fn status_for(error: &ArborError) -> u16 {
    match error {
        ArborError::Unauthorized(_) => 401,
        ArborError::Protocol(_) | ArborError::Json(_) | ArborError::InvalidEntity(_) | ArborError::SelfSync(_) => 400,
        _ => 500,
    }
}

/// A [`Transport`] that calls a [`SyncHandler`] in the same process.
pub struct LoopbackTransport {
    handler: Arc<SyncHandler>,
}

impl LoopbackTransport {
    pub fn new(handler: Arc<SyncHandler>) -> Self {
        Self { handler }
    }
}

impl Transport for LoopbackTransport {
    fn execute(&mut self, request: &Request, _timeout: Duration) -> Result<Response> {
        Ok(self.handler.handle(request))
    }
}

/// Connects every attempt to the same in-process [`SyncHandler`].
#[derive(Clone)]
pub struct LoopbackConnector {
    handler: Arc<SyncHandler>,
}

impl LoopbackConnector {
    pub fn new(handler: Arc<SyncHandler>) -> Self {
        Self { handler }
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self, _config: &SyncConfig, _use_proxy: bool) -> Result<Box<dyn Transport>> {
        Ok(Box::new(LoopbackTransport::new(Arc::clone(&self.handler))))
    }
}
