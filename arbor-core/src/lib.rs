//! Replication core for Arbor Notes, a hierarchical note-taking application.
//!
//! Two replicas of one note database stay eventually consistent by exchanging
//! entity changes. The primary entry points are [`Replica`], an open replica
//! database through which every replicated mutation goes, and [`SyncDriver`],
//! which runs the sync cycle against a peer served by a [`SyncHandler`].
//!
//! Types are re-exported from their respective sub-modules for convenience;
//! consumers should import from the crate root rather than the `core` module.

pub mod core;

// Re-export commonly used types.
#[doc(inline)]
pub use core::{
    apply::{ApplyReport, Resolution},
    content_hash::{find_mismatches, SectorHashes},
    entity::{content_hash, sector_of, EntityKind, EntityRow},
    entity_change::{ChangeLog, EntityChange, NewChange, Outgoing, WireBatch, WireChange},
    erasure::{Eraser, ErasureReport, DEFAULT_RETENTION},
    error::{ArborError, FailureKind, Result},
    guard::{ExclusiveSection, SectionTicket},
    instance::{generate_entity_id, generate_instance_id},
    protection::ProtectionKey,
    replica::{now_millis, Replica},
    storage::Storage,
    sync::{
        Connector, LoopbackConnector, LoopbackTransport, NoSeed, PageAssembler, Request, Response, Route,
        SchedulerHandle, Seed, SeedProvider, SyncClient, SyncConfig, SyncContext, SyncDriver, SyncHandler,
        SyncOutcome, SyncOverride, SyncScheduler, SyncSession, SyncState, SyncStats, Transport,
        PROTOCOL_VERSION,
    },
};

#[cfg(feature = "http")]
#[doc(inline)]
pub use core::sync::{HttpConnector, HttpTransport};
