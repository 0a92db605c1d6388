//! The sync cycle between this replica and its configured peer.
//!
//! ## States
//!
//! ```text
//! Login -> Push -> Pull -> PushAgain -> Finish -> Verify -> Done
//!   ^                                                 |
//!   +-------------------------------------------------+
//! ```
//!
//! Each state is one method on [`SyncContext`] that performs its round trips
//! and returns the next state. Verify loops back to Login while either side
//! still has changes in flight or sector hashes disagree. Loops caused by new
//! writes are bounded only by the attempt deadline; once sectors have been
//! re-queued `max_requeue_rounds` times and still differ, the attempt fails as
//! inconsistent.
//!
//! Any error ends the attempt. [`SyncDriver::sync`] turns it into a failed
//! [`SyncOutcome`]; watermarks persisted so far stay, and the next attempt
//! resumes from them.

use crate::core::content_hash::find_mismatches;
use crate::core::entity_change::CHANGE_BATCH_SIZE;
use crate::core::error::FailureKind;
use crate::core::guard::ExclusiveSection;
use crate::core::replica::Replica;
use crate::core::sync::config::{load_override, override_file_path, SyncConfig};
use crate::core::sync::protocol::{login_request, PushRequest};
use crate::core::sync::seed::{NoSeed, Seed, SeedProvider};
use crate::core::sync::transport::{Connector, SyncClient, DEFAULT_PAGE_SIZE};
use crate::{ArborError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Login,
    Push,
    Pull,
    PushAgain,
    Finish,
    Verify,
    Done,
}

/// Counters of one sync attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub pushed: usize,
    pub pulled: usize,
    pub applied: usize,
    pub ignored: usize,
    pub skipped: usize,
    pub verify_rounds: u32,
    pub requeue_rounds: u32,
    pub requeued_sectors: usize,
}

/// Result of one sync attempt, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub stats: SyncStats,
}

impl SyncOutcome {
    fn succeeded(stats: SyncStats) -> Self {
        Self {
            success: true,
            kind: None,
            message: None,
            stats,
        }
    }

    fn failed(error: &ArborError) -> Self {
        Self {
            success: false,
            kind: Some(error.failure_kind()),
            message: Some(error.user_message()),
            stats: SyncStats::default(),
        }
    }
}

/// What the driver learned about its peer at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    pub peer_instance_id: String,
    pub peer_max_sequence_id: i64,
}

/// State of one attempt: the replica, the wire client carrying the deadline,
/// and the peer session once logged in.
pub struct SyncContext<'a> {
    replica: &'a mut Replica,
    client: SyncClient,
    seeder: &'a dyn SeedProvider,
    config: SyncConfig,
    session: Option<SyncSession>,
    stats: SyncStats,
}

impl<'a> SyncContext<'a> {
    pub fn new(
        replica: &'a mut Replica,
        client: SyncClient,
        seeder: &'a dyn SeedProvider,
        config: SyncConfig,
    ) -> Self {
        Self {
            replica,
            client,
            seeder,
            config,
            session: None,
            stats: SyncStats::default(),
        }
    }

    pub fn session(&self) -> Option<&SyncSession> {
        self.session.as_ref()
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    fn peer_instance_id(&self) -> Result<&str> {
        self.session
            .as_ref()
            .map(|s| s.peer_instance_id.as_str())
            .ok_or_else(|| ArborError::Protocol("Not logged in".to_string()))
    }

    /// Runs states from Login until Done.
    pub fn run(&mut self) -> Result<SyncStats> {
        let mut state = SyncState::Login;
        while state != SyncState::Done {
            log::debug!("Sync state {state:?}");
            state = self.step(state)?;
        }
        Ok(self.stats.clone())
    }

    /// Performs one state and returns the next.
    pub fn step(&mut self, state: SyncState) -> Result<SyncState> {
        match state {
            SyncState::Login => self.login(),
            SyncState::Push => self.push(SyncState::Pull),
            SyncState::Pull => self.pull(),
            SyncState::PushAgain => self.push(SyncState::Finish),
            SyncState::Finish => self.finish(),
            SyncState::Verify => self.verify(),
            SyncState::Done => Ok(SyncState::Done),
        }
    }

    fn login(&mut self) -> Result<SyncState> {
        if self.seeder.peer_needs_seed(&self.config)? {
            log::info!("Peer {} needs a seed", self.config.server_address);
            self.seeder.send_seed(&self.config, &Seed::from_replica(self.replica)?)?;
        }

        let request = login_request(&self.replica.document_secret()?, chrono::Utc::now())?;
        let answer = self.client.login(&request)?;
        if answer.instance_id == self.replica.instance_id() {
            return Err(ArborError::SelfSync(answer.instance_id));
        }

        let last_pulled = self.replica.last_pulled()?;
        if last_pulled > answer.max_sequence_id {
            log::warn!(
                "Peer {} has max sequence id {} below our pull watermark {last_pulled}; lowering it",
                answer.instance_id,
                answer.max_sequence_id
            );
            self.replica.set_last_pulled(answer.max_sequence_id)?;
        }

        log::info!("Logged in to peer {}", answer.instance_id);
        self.session = Some(SyncSession {
            peer_instance_id: answer.instance_id,
            peer_max_sequence_id: answer.max_sequence_id,
        });
        Ok(SyncState::Push)
    }

    fn push(&mut self, next: SyncState) -> Result<SyncState> {
        let peer = self.peer_instance_id()?.to_string();
        loop {
            let since = self.replica.last_pushed()?;
            let outgoing =
                self.replica
                    .change_log()
                    .outgoing(self.replica.connection(), since, Some(peer.as_str()), CHANGE_BATCH_SIZE)?;
            if outgoing.last_sequence_id == since {
                break;
            }

            if !outgoing.records.is_empty() {
                let count = outgoing.records.len();
                let request = PushRequest {
                    entities: outgoing.records,
                    origin_instance_id: self.replica.instance_id().to_string(),
                };
                let report = self.client.push_changes(&request)?;
                log::debug!("Pushed {count} changes, peer applied {}", report.applied);
                self.stats.pushed += count;
            }
            self.replica.set_last_pushed(outgoing.last_sequence_id)?;
        }
        Ok(next)
    }

    fn pull(&mut self) -> Result<SyncState> {
        loop {
            let since = self.replica.last_pulled()?;
            let answer = self.client.pull_changes(since, self.replica.instance_id())?;
            if answer.outstanding_count > 0 && answer.last_sequence_id <= since {
                return Err(ArborError::Protocol(format!(
                    "Peer reported {} outstanding changes but did not advance past {since}",
                    answer.outstanding_count
                )));
            }

            let report = self.replica.apply_pulled(&answer.changes, answer.last_sequence_id)?;
            self.stats.pulled += answer.changes.len();
            self.stats.applied += report.applied;
            self.stats.ignored += report.ignored;
            self.stats.skipped += report.skipped;

            if answer.outstanding_count == 0 {
                return Ok(SyncState::PushAgain);
            }
        }
    }

    fn finish(&mut self) -> Result<SyncState> {
        self.client.finish_cycle()?;
        Ok(SyncState::Verify)
    }

    fn verify(&mut self) -> Result<SyncState> {
        self.stats.verify_rounds += 1;
        let peer = self.client.check_hashes()?;
        let last_pulled = self.replica.last_pulled()?;
        let unpushed = self
            .replica
            .change_log()
            .outstanding_after(self.replica.connection(), self.replica.last_pushed()?)?;
        if peer.max_sequence_id > last_pulled || unpushed > 0 {
            log::info!(
                "Changes arrived during the cycle (peer at {}, pulled to {last_pulled}, {unpushed} unpushed); syncing again",
                peer.max_sequence_id
            );
            return Ok(SyncState::Login);
        }

        let local = self.replica.sector_hashes()?;
        let mismatches = find_mismatches(&local, &peer.sector_hashes);
        if mismatches.is_empty() {
            log::info!("Sector hashes agree with the peer");
            return Ok(SyncState::Done);
        }

        if self.stats.requeue_rounds >= self.config.max_requeue_rounds {
            return Err(ArborError::Consistency(format!(
                "{} sectors still differ after re-queueing them {} times",
                mismatches.len(),
                self.stats.requeue_rounds
            )));
        }
        self.stats.requeue_rounds += 1;
        for (kind, sector) in mismatches {
            log::warn!("Sector '{sector}' of {kind} differs from the peer; re-queueing on both sides");
            self.replica.requeue_sector(kind, &sector)?;
            self.client.queue_sector(kind, &sector)?;
            self.stats.requeued_sectors += 1;
        }
        Ok(SyncState::Login)
    }
}

/// Runs sync attempts for one replica.
///
/// Owns the state that outlives a single attempt: the connector, the seed
/// provider and the proxy toggle.
pub struct SyncDriver {
    connector: Box<dyn Connector>,
    seeder: Box<dyn SeedProvider>,
    guard: Arc<ExclusiveSection>,
    override_path: Option<PathBuf>,
    page_size: usize,
    use_proxy: bool,
}

impl SyncDriver {
    pub fn new(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            seeder: Box::new(NoSeed),
            guard: ExclusiveSection::global(),
            override_path: Some(override_file_path()),
            page_size: DEFAULT_PAGE_SIZE,
            use_proxy: false,
        }
    }

    #[must_use]
    pub fn with_seed_provider(mut self, seeder: Box<dyn SeedProvider>) -> Self {
        self.seeder = seeder;
        self
    }

    #[must_use]
    pub fn with_guard(mut self, guard: Arc<ExclusiveSection>) -> Self {
        self.guard = guard;
        self
    }

    /// Sets the override file consulted on every attempt; `None` disables it.
    #[must_use]
    pub fn with_override_path(mut self, path: Option<PathBuf>) -> Self {
        self.override_path = path;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Whether the next attempt routes through the configured proxy.
    pub fn uses_proxy(&self) -> bool {
        self.use_proxy
    }

    /// Effective configuration: stored options with the override file on top.
    pub fn resolve_config(&self, replica: &Replica) -> Result<SyncConfig> {
        let config = SyncConfig::load(replica)?;
        Ok(match self.override_path.as_deref().and_then(load_override) {
            Some(over) => config.with_override(&over),
            None => config,
        })
    }

    /// Runs one complete attempt inside the exclusive section.
    pub fn sync(&mut self, replica: &mut Replica) -> SyncOutcome {
        let guard = Arc::clone(&self.guard);
        match guard.run(|| self.attempt(replica)) {
            Ok(stats) => {
                log::info!(
                    "Sync finished: pushed {}, pulled {}, {} verification rounds",
                    stats.pushed,
                    stats.pulled,
                    stats.verify_rounds
                );
                SyncOutcome::succeeded(stats)
            }
            Err(e) => {
                if e.failure_kind() != FailureKind::Configuration {
                    self.use_proxy = !self.use_proxy;
                    log::info!("Next sync attempt will {} the proxy", if self.use_proxy { "use" } else { "skip" });
                }
                log::warn!("Sync failed: {e}");
                SyncOutcome::failed(&e)
            }
        }
    }

    fn attempt(&mut self, replica: &mut Replica) -> Result<SyncStats> {
        let config = self.resolve_config(replica)?;
        if !config.is_configured() {
            return Err(ArborError::NotConfigured("No sync server address set".to_string()));
        }

        let transport = self.connector.connect(&config, self.use_proxy)?;
        let client = SyncClient::new(transport, Instant::now() + config.timeout()).with_page_size(self.page_size);
        let mut context = SyncContext::new(replica, client, self.seeder.as_ref(), config);
        context.run()
    }
}
