//! judgment-daemon - Anchor and ledger engine daemon.
//!
//! Runtime side of the engine: `SQLite`-backed record and billing storage,
//! the OpenTimestamps anchor transport, the create/query service, and the
//! background proof-upgrade worker. Pure domain logic (hashing, pricing,
//! validation, configuration) lives in `judgment-core`.
//!
//! The store and the ledger share one database connection. That is what lets
//! a create commit its charge, its usage bump, and its record insert as a
//! single transaction.

pub mod anchor;
pub mod ledger;
pub mod service;
pub mod store;
pub mod worker;

pub use anchor::{AnchorService, AnchorTransport, OtsCliTransport, TransportError};
pub use ledger::{BillingLedger, LedgerError};
pub use service::{JudgmentService, ServiceError};
pub use store::{RecordStore, StoreError};
pub use worker::ProofUpgradeWorker;
