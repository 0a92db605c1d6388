//! Stable replica identity and shared document secret.

use rand::distr::{Alphanumeric, SampleString};

/// Length of generated entity and instance identifiers.
const ID_LENGTH: usize = 12;

/// Length of the generated document secret shared between replicas.
const SECRET_LENGTH: usize = 32;

/// Generates a fresh instance identifier of the form `inst-<12 alphanumerics>`.
///
/// The identifier is generated once when a replica is created and stored in
/// `replica_meta`; it never changes afterwards.
pub fn generate_instance_id() -> String {
    format!("inst-{}", Alphanumeric.sample_string(&mut rand::rng(), ID_LENGTH))
}

/// Generates a random alphanumeric entity id.
///
/// The first character doubles as the sector of the id, so ids are spread
/// evenly across sectors.
pub fn generate_entity_id() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), ID_LENGTH)
}

/// Generates the secret used to sign sync logins.
pub fn generate_document_secret() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), SECRET_LENGTH)
}
