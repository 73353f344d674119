//! # keygate-db
//!
//! Postgres implementation of [`keygate_core::EntitlementStore`].
//!
//! The memory store in keygate-core is the behavioral reference; this
//! crate mirrors it statement-for-statement with the atomic sections
//! expressed as transactions. Issuance goes through the
//! `create_credential_key` SQL function (see `migrations/`), which locks
//! the intent row so concurrent webhook workers cannot double-issue.

mod postgres;

pub use postgres::PgEntitlementStore;
