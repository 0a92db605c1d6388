//! Bootstrap of a peer that has no document yet.
//!
//! Seeding itself (shipping a whole database) happens outside the
//! replication core. The driver only asks whether the peer needs a seed and
//! hands over the identity material a fresh replica must adopt.

use crate::core::replica::Replica;
use crate::core::sync::config::SyncConfig;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Document identity shared by every replica of one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    pub document_secret: String,
    /// Hex-encoded salt for deriving the protection key.
    pub protection_salt: String,
}

impl Seed {
    pub fn from_replica(replica: &Replica) -> Result<Self> {
        Ok(Self {
            document_secret: replica.document_secret()?,
            protection_salt: hex::encode(replica.protection_salt()?),
        })
    }

    /// Makes `replica` share this document's identity.
    pub fn adopt(&self, replica: &mut Replica) -> Result<()> {
        let salt = hex::decode(&self.protection_salt)
            .map_err(|e| crate::ArborError::Protocol(format!("Seed carries a corrupt salt: {e}")))?;
        replica.set_document_secret(&self.document_secret)?;
        replica.set_protection_salt(&salt)?;
        log::info!("Replica {} adopted a seed", replica.instance_id());
        Ok(())
    }
}

/// Provides seeding for peers that are still empty.
pub trait SeedProvider: Send + Sync {
    fn peer_needs_seed(&self, config: &SyncConfig) -> Result<bool>;

    fn send_seed(&self, config: &SyncConfig, seed: &Seed) -> Result<()>;
}

/// For setups where every replica is created from a seed up front.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSeed;

impl SeedProvider for NoSeed {
    fn peer_needs_seed(&self, _config: &SyncConfig) -> Result<bool> {
        Ok(false)
    }

    fn send_seed(&self, _config: &SyncConfig, _seed: &Seed) -> Result<()> {
        Ok(())
    }
}
