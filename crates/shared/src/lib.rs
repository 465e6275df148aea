#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ExamPrep shared building blocks
//!
//! Domain vocabulary used across crates, database pool helpers and the bounded
//! polling utility.

pub mod db;
pub mod poll;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use poll::{poll_until, PollOutcome, PollSchedule};
pub use types::{
    ContentKind, ErrorCategory, ParseEnumError, SessionStatus, SubscriptionStatus,
    SubscriptionTier,
};
