//! judgment-core - Anchor & Ledger Engine domain logic
//!
//! This crate holds the pure, I/O-free parts of the judgment anchor engine:
//!
//! - [`canonical`]: deterministic JSON canonicalization and record hashing
//! - [`pricing`]: the usage-tiered pricing table and quote computation
//! - [`record`]: record, anchor, and create-request/response types
//! - [`validation`]: create-request validation (typed errors, no side effects)
//! - [`config`]: engine configuration loaded from TOML
//!
//! Everything that touches a database, a clock-driven loop, or an external
//! timestamping transport lives in `judgment-daemon`. Keeping this split means
//! the hashing and pricing rules can be exercised without any runtime.

pub mod canonical;
pub mod config;
pub mod pricing;
pub mod record;
pub mod validation;

pub use canonical::{canonicalize, record_hash};
pub use config::{BillingConfig, ConfigError, EngineConfig, TransportConfig, WorkerConfig};
pub use pricing::{NextTierInfo, PriceQuote, PricingError, PricingTable, Tier};
pub use record::{
    AnchorInfo, AnchorType, BillingInfo, CreateRequest, CreateResponse, ImmutabilityRequest,
    Record, RecordContent,
};
pub use validation::{RequestLimits, ValidationError, validate_create_request};
