//! Internal domain modules for the Arbor replication core.
//!
//! All public types from these modules are re-exported at the crate root
//! with `#[doc(inline)]`; import from there in preference to this module.

pub mod apply;
pub mod content_hash;
pub mod entity;
pub mod entity_change;
pub mod erasure;
pub mod error;
pub mod guard;
pub mod instance;
pub mod protection;
pub mod replica;
pub mod storage;
pub mod sync;

#[doc(inline)]
pub use apply::{ApplyReport, Resolution};
#[doc(inline)]
pub use content_hash::SectorHashes;
#[doc(inline)]
pub use entity::{EntityKind, EntityRow};
#[doc(inline)]
pub use entity_change::{ChangeLog, EntityChange, NewChange, Outgoing, WireBatch, WireChange};
#[doc(inline)]
pub use erasure::{Eraser, ErasureReport};
#[doc(inline)]
pub use error::{ArborError, FailureKind, Result};
#[doc(inline)]
pub use guard::{ExclusiveSection, SectionTicket};
#[doc(inline)]
pub use protection::ProtectionKey;
#[doc(inline)]
pub use replica::Replica;
#[doc(inline)]
pub use storage::Storage;
