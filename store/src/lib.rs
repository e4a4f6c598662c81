//! Embedded per-project persistence for RalphX: work items, runs, sessions,
//! resources and their version history, and credentials. One SQLite file per
//! project, opened with WAL journaling and a single in-process writer.

mod credential;
mod error;
mod model;
mod project;
mod schema;
mod util;

pub use credential::{Credential, CredentialStore};
pub use error::{StoreError, StoreResult};
pub use model::*;
pub use project::ProjectStore;
pub use schema::SCHEMA_VERSION;
pub use util::now_secs;
