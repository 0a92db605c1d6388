//! Replication between two replicas.
//!
//! [`SyncDriver`](driver::SyncDriver) runs the cycle on the initiating side,
//! [`SyncHandler`](handler::SyncHandler) answers it on the peer. They talk
//! through a [`Transport`](transport::Transport): HTTP in production
//! (feature `http`), in-process loopback in tests and embedded setups.

pub mod config;
pub mod driver;
pub mod handler;
#[cfg(feature = "http")]
pub mod http;
pub mod pages;
pub mod protocol;
pub mod scheduler;
pub mod seed;
pub mod transport;

#[doc(inline)]
pub use config::{SyncConfig, SyncOverride};
#[doc(inline)]
pub use driver::{SyncContext, SyncDriver, SyncOutcome, SyncSession, SyncState, SyncStats};
#[doc(inline)]
pub use handler::{LoopbackConnector, LoopbackTransport, SyncHandler};
#[cfg(feature = "http")]
#[doc(inline)]
pub use http::{HttpConnector, HttpTransport};
#[doc(inline)]
pub use pages::PageAssembler;
#[doc(inline)]
pub use protocol::PROTOCOL_VERSION;
#[doc(inline)]
pub use scheduler::{SchedulerHandle, SyncScheduler};
#[doc(inline)]
pub use seed::{NoSeed, Seed, SeedProvider};
#[doc(inline)]
pub use transport::{Connector, Request, Response, Route, SyncClient, Transport};
