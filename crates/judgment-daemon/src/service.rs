//! Record creation and query orchestration.
//!
//! [`JudgmentService`] owns the create pipeline: validate, replay idempotent
//! duplicates, hash, quote and pre-check billing, submit the anchor, then
//! commit the charge and the record insert as one database transaction.
//! Ordering matters: validation and the balance pre-check happen before any
//! side effect, the anchor submission happens outside the transaction (it
//! talks to an external system and must not hold the write lock), and the
//! charge is re-verified inside the transaction so a stale pre-check can
//! never drive a balance negative. A failed insert rolls the charge back with
//! it; no orphaned charges.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::Connection;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use judgment_core::canonical::record_hash;
use judgment_core::pricing::{BulkEstimate, PriceQuote, PricingTable};
use judgment_core::record::{
    AnchorInfo, AnchorType, BillingInfo, CreateRequest, CreateResponse, Record, RecordContent,
};
use judgment_core::validation::{RequestLimits, ValidationError, validate_create_request};

use crate::anchor::{AnchorOutcome, AnchorService};
use crate::ledger::{BillingLedger, ChargeReceipt, LedgerError, charge_tx};
use crate::store::{RecordStore, StoreError, insert_record_tx, lock};

/// Failures surfaced to the API boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// The request failed validation; nothing was attempted.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The account balance does not cover the anchor price. Nothing was
    /// charged or persisted.
    #[error("insufficient balance: have {balance}, need {required} (short {shortfall})")]
    InsufficientBalance {
        /// Current balance.
        balance: Decimal,
        /// Price of the requested anchor.
        required: Decimal,
        /// Minimum top-up needed.
        shortfall: Decimal,
        /// Tier the anchor would have been priced in.
        tier: String,
    },

    /// Record persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Billing ledger failure other than insufficient balance.
    #[error(transparent)]
    Ledger(LedgerError),
}

/// Orchestrates record creation, billing, and anchoring.
#[derive(Clone)]
pub struct JudgmentService {
    store: RecordStore,
    ledger: BillingLedger,
    anchors: AnchorService,
    pricing: PricingTable,
    limits: RequestLimits,
}

impl JudgmentService {
    /// Assembles the service from its collaborators. The store and ledger are
    /// expected to share one connection so creates can commit atomically
    /// across both.
    #[must_use]
    pub fn new(
        store: RecordStore,
        ledger: BillingLedger,
        anchors: AnchorService,
        pricing: PricingTable,
        limits: RequestLimits,
    ) -> Self {
        Self {
            store,
            ledger,
            anchors,
            pricing,
            limits,
        }
    }

    /// Creates a record for `account`.
    ///
    /// Duplicate idempotency keys replay the original response instead of
    /// creating anything. Anchor failures degrade the record rather than
    /// failing the request; an insufficient balance fails it before any side
    /// effect.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Validation`] for malformed input,
    /// [`ServiceError::InsufficientBalance`] when the account cannot cover a
    /// billable anchor, or a store/ledger error on infrastructure failure.
    pub async fn create_record(
        &self,
        account: &str,
        request: CreateRequest,
    ) -> Result<CreateResponse, ServiceError> {
        validate_create_request(&request, &self.limits)?;

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency_key_async(key).await? {
                info!(record_id = %existing.id, key = %key, "replaying idempotent create");
                return Ok(replay_response(&existing));
            }
        }

        let (requested, resolve_note) = match &request.immutability {
            None => (AnchorType::None, None),
            Some(im) => self.anchors.resolve(&im.anchor_type),
        };

        let now = Utc::now();
        let mut record = Record {
            id: new_record_id(),
            entity: request.entity,
            action: request.action,
            scope: request.scope.unwrap_or_else(|| serde_json::json!({})),
            timestamp: request.timestamp.unwrap_or(now),
            recorded_at: now,
            anchor_type: AnchorType::None,
            anchor_reference: None,
            anchor_proof: None,
            anchor_processed_at: None,
            idempotency_key: request.idempotency_key,
        };
        let hash = record_hash(&RecordContent::from_record(&record));

        // Quote and pre-check billing before touching the transport. The
        // check is advisory; the authoritative verification happens again
        // inside the commit transaction.
        let quote = if requested.is_billable() {
            let count = self
                .ledger
                .monthly_anchor_count_async(account)
                .await
                .map_err(ServiceError::Ledger)?;
            let quote = self.pricing.price_for_next_unit(count);
            let check = self
                .ledger
                .check_balance_async(account, quote.price)
                .await
                .map_err(ServiceError::Ledger)?;
            if !check.sufficient {
                return Err(ServiceError::InsufficientBalance {
                    balance: check.balance,
                    required: check.required,
                    shortfall: check.shortfall,
                    tier: quote.tier,
                });
            }
            Some(quote)
        } else {
            None
        };

        let outcome = self.anchors.submit(requested, &hash).await;
        record.anchor_type = outcome.effective;
        record.anchor_reference = outcome.reference.clone();
        record.anchor_proof = outcome.proof.clone();
        if !outcome.pending {
            record.anchor_processed_at = outcome.anchored_at;
        }

        // The price was quoted for the requested anchor type; a degraded
        // submission still consumed the submission attempt and is still
        // charged. Zero-priced tiers charge nothing.
        let charge = quote
            .as_ref()
            .filter(|q| q.price > Decimal::ZERO)
            .map(|q| (q.price, q.tier.clone()));

        let receipt = match self.commit_create(account, &record, charge).await {
            Ok(receipt) => receipt,
            Err(ServiceError::Store(StoreError::IdempotencyConflict { key })) => {
                // Lost a concurrent race on the same key; the whole
                // transaction (charge included) rolled back. Replay the
                // winner.
                let existing = self
                    .store
                    .find_by_idempotency_key_async(&key)
                    .await?
                    .ok_or(StoreError::IdempotencyConflict { key })?;
                info!(record_id = %existing.id, "replaying create after losing idempotency race");
                return Ok(replay_response(&existing));
            },
            Err(error) => return Err(error),
        };

        info!(
            record_id = %record.id,
            anchor_type = record.anchor_type.as_str(),
            charged = receipt.as_ref().map(|r| r.charged.to_string()).unwrap_or_default(),
            "record created"
        );

        Ok(build_response(&record, &outcome, resolve_note, quote, receipt))
    }

    /// Commits the charge (when present) and the record insert as one
    /// transaction.
    async fn commit_create(
        &self,
        account: &str,
        record: &Record,
        charge: Option<(Decimal, String)>,
    ) -> Result<Option<ChargeReceipt>, ServiceError> {
        let conn: Arc<Mutex<Connection>> = self.store.connection();
        let account = account.to_string();
        let record = record.clone();

        tokio::task::spawn_blocking(move || {
            let guard = lock(&conn)?;
            guard
                .execute("BEGIN IMMEDIATE", [])
                .map_err(|e| StoreError::Database(e.to_string()))?;

            let result = (|| {
                let receipt = match &charge {
                    Some((amount, tier)) => Some(
                        charge_tx(&guard, &account, *amount, &record.id, record.recorded_at)
                            .map_err(|e| map_charge_error(e, tier))?,
                    ),
                    None => None,
                };
                insert_record_tx(&guard, &record)?;
                Ok(receipt)
            })();

            commit_or_rollback(&guard, result)
        })
        .await
        .map_err(|e| ServiceError::Store(StoreError::Database(format!("task join failed: {e}"))))?
    }

    /// Fetches a record by id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn get_record(&self, id: &str) -> Result<Option<Record>, ServiceError> {
        Ok(self.store.get_async(id).await?)
    }

    /// Lists records for one entity, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn list_records(
        &self,
        entity: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Record>, ServiceError> {
        let store = self.store.clone();
        let entity = entity.to_string();
        tokio::task::spawn_blocking(move || store.list_by_entity(&entity, limit, offset))
            .await
            .map_err(|e| StoreError::Database(format!("task join failed: {e}")))?
            .map_err(Into::into)
    }

    /// Credits the account within the configured deposit bounds.
    ///
    /// # Errors
    ///
    /// Returns an error for out-of-bounds amounts or database failure.
    pub async fn deposit(
        &self,
        account: &str,
        amount: Decimal,
    ) -> Result<crate::ledger::DepositReceipt, ServiceError> {
        self.ledger
            .deposit_async(account, amount)
            .await
            .map_err(ServiceError::Ledger)
    }

    /// Current balance for an account.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn balance(&self, account: &str) -> Result<Decimal, ServiceError> {
        self.ledger
            .check_balance_async(account, Decimal::ZERO)
            .await
            .map(|check| check.balance)
            .map_err(ServiceError::Ledger)
    }

    /// Quotes the price of the account's next anchor.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn quote_next_anchor(&self, account: &str) -> Result<PriceQuote, ServiceError> {
        let count = self
            .ledger
            .monthly_anchor_count_async(account)
            .await
            .map_err(ServiceError::Ledger)?;
        Ok(self.pricing.price_for_next_unit(count))
    }

    /// Estimates the cost of a batch of further anchors for the account.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn estimate_bulk(
        &self,
        account: &str,
        anchor_count: u64,
    ) -> Result<BulkEstimate, ServiceError> {
        let count = self
            .ledger
            .monthly_anchor_count_async(account)
            .await
            .map_err(ServiceError::Ledger)?;
        Ok(self.pricing.estimate_bulk(count, anchor_count))
    }
}

fn new_record_id() -> String {
    format!("jgd_{}", Uuid::new_v4().simple())
}

/// The charge inside the commit transaction re-verifies the balance; losing
/// that race surfaces the same structured rejection as the pre-check.
fn map_charge_error(error: LedgerError, tier: &str) -> ServiceError {
    match error {
        LedgerError::InsufficientBalance {
            balance,
            required,
            shortfall,
        } => {
            warn!(%balance, %required, "balance changed between pre-check and charge");
            ServiceError::InsufficientBalance {
                balance,
                required,
                shortfall,
                tier: tier.to_string(),
            }
        },
        other => ServiceError::Ledger(other),
    }
}

fn commit_or_rollback<T>(
    conn: &Connection,
    result: Result<T, ServiceError>,
) -> Result<T, ServiceError> {
    match result {
        Ok(value) => {
            conn.execute("COMMIT", []).map_err(|e| {
                let _ = conn.execute("ROLLBACK", []);
                ServiceError::Store(StoreError::Database(format!(
                    "commit failed (rolled back): {e}"
                )))
            })?;
            Ok(value)
        },
        Err(error) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(error)
        },
    }
}

fn build_response(
    record: &Record,
    outcome: &AnchorOutcome,
    resolve_note: Option<String>,
    quote: Option<PriceQuote>,
    receipt: Option<ChargeReceipt>,
) -> CreateResponse {
    let billing = match (quote, receipt) {
        (Some(quote), Some(receipt)) => Some(BillingInfo {
            charged: receipt.charged,
            tier: quote.tier,
            current_count: quote.current_count + 1,
            next_tier: quote.next_tier,
        }),
        _ => None,
    };

    CreateResponse {
        id: record.id.clone(),
        status: "recorded".to_string(),
        timestamp: record.recorded_at,
        immutability_anchor: AnchorInfo {
            anchor_type: record.anchor_type,
            reference: record.anchor_reference.clone(),
            anchored_at: outcome.anchored_at,
            note: outcome.note.clone().or(resolve_note),
        },
        billing,
        note: None,
    }
}

fn replay_response(record: &Record) -> CreateResponse {
    CreateResponse {
        id: record.id.clone(),
        status: "recorded".to_string(),
        timestamp: record.recorded_at,
        immutability_anchor: AnchorInfo {
            anchor_type: record.anchor_type,
            reference: record.anchor_reference.clone(),
            anchored_at: record.anchor_processed_at,
            note: None,
        },
        billing: None,
        note: Some("existing record returned for idempotency key".to_string()),
    }
}
