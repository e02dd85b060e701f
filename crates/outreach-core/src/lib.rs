//! # Outreach Core
//! Shared types, configuration, errors and the collaborator traits the
//! scheduling engine consumes (channel adapters, lead source, clock).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{OutreachError, Result};
