//! Shared types for the relaychat engine and its collaborators.

pub mod error;
pub mod models;
pub mod protocol;
pub mod validation;

pub use error::*;
pub use models::*;
pub use protocol::*;
