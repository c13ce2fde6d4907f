//! Encrypted account store
//!
//! SQLite-backed repository for upstream accounts, their audit trail,
//! health snapshots, and a small key-value scratch area. Refresh tokens
//! are sealed with an AEAD box before they touch disk; only the store
//! hands out decrypted tokens, wrapped in [`common::Secret`].
//!
//! One `AccountStore` owns the database for the life of the process. All
//! state transitions (dispatch outcomes, health demotions, admin
//! mutations) go through [`AccountStore::update_with_audit`], which
//! applies the row update and appends the matching audit event in a
//! single transaction.

pub mod crypto;
pub mod error;
mod migrations;
pub mod model;
pub mod store;

pub use crypto::{CryptoBox, fingerprint};
pub use error::{Error, Result};
pub use model::{
    Account, AccountPatch, AccountStatus, AuditActor, AuditEvent, AuditFilter, HealthSnapshot,
    ImportEntry, ImportReport, InsertOutcome, NewAuditEvent, QuotaSnapshot, Statistics,
};
pub use store::AccountStore;
