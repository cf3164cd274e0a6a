//! In-memory collaborators for tests.
//!
//! Used by the unit tests next to each component and by the end-to-end
//! scenarios under `tests/`.

mod clock;
mod cluster;
mod database;

pub use clock::FakeClock;
pub use cluster::{CertificateBehavior, FakeCluster};
pub use database::FakeDatabase;
