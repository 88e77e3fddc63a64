//! Atomic balance and transaction ledger.
//!
//! Accounts and their transaction rows are owned exclusively by this module;
//! nothing else writes balances. Every mutation runs as one `BEGIN IMMEDIATE`
//! transaction: the balance is re-read under the write lock, verified,
//! updated, and the transaction row appended, committing all effects together
//! or none at all. Balances are therefore always the product of applied
//! transactions, never recomputed by summation at read time.
//!
//! Amounts are `rust_decimal::Decimal`, stored as TEXT. Charges against the
//! same account serialize through the database write lock, so concurrent
//! over-budget charges admit exactly the maximal subset that keeps the
//! balance non-negative.
//!
//! Monthly usage metering lives here too: a successful anchor charge bumps a
//! per-account per-day counter, and the cumulative monthly count feeds the
//! tiered pricer.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use uuid::Uuid;

use crate::store::lock;

/// Billing tables schema.
const LEDGER_SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS account_billing (
        account_id TEXT PRIMARY KEY,
        balance TEXT NOT NULL DEFAULT '0'
    );

    CREATE TABLE IF NOT EXISTS transactions (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        amount TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('charge', 'deposit')),
        status TEXT NOT NULL,
        reference_id TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_transactions_account
        ON transactions(account_id, created_at);

    CREATE TABLE IF NOT EXISTS account_usage (
        account_id TEXT NOT NULL,
        day TEXT NOT NULL,
        anchor_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (account_id, day)
    );
";

/// Ledger failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// The account balance does not cover the requested charge. The whole
    /// charge was rolled back; no partial effect persists.
    #[error("insufficient balance: have {balance}, need {required} (short {shortfall})")]
    InsufficientBalance {
        /// Balance observed under the write lock.
        balance: Decimal,
        /// Amount the charge required.
        required: Decimal,
        /// `required - balance`.
        shortfall: Decimal,
    },

    /// A deposit fell outside the configured bounds.
    #[error("deposit {amount} outside bounds [{min}, {max}]")]
    DepositOutOfBounds {
        /// The rejected amount.
        amount: Decimal,
        /// Minimum accepted deposit.
        min: Decimal,
        /// Maximum accepted single deposit.
        max: Decimal,
    },

    /// A charge or deposit amount was zero or negative.
    #[error("amount must be positive, got {amount}")]
    NonPositiveAmount {
        /// The rejected amount.
        amount: Decimal,
    },

    /// A stored balance could not be parsed back into a decimal.
    #[error("corrupt balance for account {account}: {message}")]
    CorruptBalance {
        /// The affected account.
        account: String,
        /// Parse failure detail.
        message: String,
    },

    /// Underlying database failure.
    #[error("ledger database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<crate::store::StoreError> for LedgerError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::Database(e.to_string())
    }
}

/// Read-only balance check. Non-authoritative: the balance may change before
/// a subsequent charge, which re-verifies under the write lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceCheck {
    /// Whether the balance covered the amount at read time.
    pub sufficient: bool,
    /// Balance at read time.
    pub balance: Decimal,
    /// Amount asked about.
    pub required: Decimal,
    /// `max(0, required - balance)`.
    pub shortfall: Decimal,
}

/// Result of a committed charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    /// Amount deducted.
    pub charged: Decimal,
    /// Balance after the deduction.
    pub remaining_balance: Decimal,
    /// Identifier of the appended transaction row.
    pub transaction_id: String,
}

/// Result of a committed deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositReceipt {
    /// Amount credited.
    pub deposited: Decimal,
    /// Balance after the credit.
    pub new_balance: Decimal,
    /// Identifier of the appended transaction row.
    pub transaction_id: String,
}

/// `SQLite`-backed billing ledger.
#[derive(Clone)]
pub struct BillingLedger {
    conn: Arc<Mutex<Connection>>,
    min_deposit: Decimal,
    max_deposit: Decimal,
}

impl BillingLedger {
    /// Creates the ledger and initializes its schema.
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails.
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        min_deposit: Decimal,
        max_deposit: Decimal,
    ) -> Result<Self, LedgerError> {
        {
            let guard = lock(&conn)?;
            guard.execute_batch(LEDGER_SCHEMA_SQL)?;
        }
        Ok(Self {
            conn,
            min_deposit,
            max_deposit,
        })
    }

    /// Creates the account row with a zero balance if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn ensure_account(&self, account: &str) -> Result<(), LedgerError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO account_billing (account_id, balance) VALUES (?1, '0')",
            params![account],
        )?;
        Ok(())
    }

    /// Reads the current balance. Missing accounts read as zero.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt stored balance.
    pub fn balance(&self, account: &str) -> Result<Decimal, LedgerError> {
        let conn = lock(&self.conn)?;
        read_balance(&conn, account)
    }

    /// Read-only sufficiency check.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt stored balance.
    pub fn check_balance(&self, account: &str, required: Decimal) -> Result<BalanceCheck, LedgerError> {
        let balance = self.balance(account)?;
        Ok(BalanceCheck {
            sufficient: balance >= required,
            balance,
            required,
            shortfall: (required - balance).max(Decimal::ZERO),
        })
    }

    /// Atomically verifies and charges the account, appending a `charge`
    /// transaction row and bumping the daily anchor-usage counter.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientBalance`] when the balance observed
    /// under the write lock does not cover `amount`; the transaction is then
    /// rolled back in full.
    pub fn charge(
        &self,
        account: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<ChargeReceipt, LedgerError> {
        let conn = lock(&self.conn)?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = charge_tx(&conn, account, amount, reference, Utc::now());
        finish_tx(&conn, result)
    }

    /// Validates bounds, then atomically credits the account and appends a
    /// `deposit` transaction row.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DepositOutOfBounds`] for amounts outside the
    /// configured bounds, or a database error.
    pub fn deposit(&self, account: &str, amount: Decimal) -> Result<DepositReceipt, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::NonPositiveAmount { amount });
        }
        if amount < self.min_deposit || amount > self.max_deposit {
            return Err(LedgerError::DepositOutOfBounds {
                amount,
                min: self.min_deposit,
                max: self.max_deposit,
            });
        }

        let conn = lock(&self.conn)?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| {
            conn.execute(
                "INSERT OR IGNORE INTO account_billing (account_id, balance) VALUES (?1, '0')",
                params![account],
            )?;
            let balance = read_balance(&conn, account)?;
            let new_balance = balance + amount;
            conn.execute(
                "UPDATE account_billing SET balance = ?1 WHERE account_id = ?2",
                params![new_balance.to_string(), account],
            )?;
            let transaction_id = new_transaction_id();
            conn.execute(
                "INSERT INTO transactions (id, account_id, amount, kind, status, reference_id, created_at) \
                 VALUES (?1, ?2, ?3, 'deposit', 'completed', ?4, ?5)",
                params![
                    transaction_id,
                    account,
                    amount.to_string(),
                    format!("deposit_{}", Utc::now().timestamp_millis()),
                    judgment_core::record::rfc3339(Utc::now()),
                ],
            )?;
            Ok(DepositReceipt {
                deposited: amount,
                new_balance,
                transaction_id,
            })
        })();
        finish_tx(&conn, result)
    }

    /// Cumulative anchor count for the current calendar month.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn monthly_anchor_count(&self, account: &str) -> Result<u64, LedgerError> {
        self.monthly_anchor_count_at(account, Utc::now())
    }

    /// Cumulative anchor count for the calendar month containing `now`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn monthly_anchor_count_at(
        &self,
        account: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let month_start = now.format("%Y-%m-01").to_string();
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COALESCE(SUM(anchor_count), 0) FROM account_usage \
             WHERE account_id = ?1 AND day >= ?2",
            params![account, month_start],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Async wrapper around [`Self::charge`].
    ///
    /// # Errors
    ///
    /// See [`Self::charge`].
    pub async fn charge_async(
        &self,
        account: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<ChargeReceipt, LedgerError> {
        let ledger = self.clone();
        let account = account.to_string();
        let reference = reference.to_string();
        tokio::task::spawn_blocking(move || ledger.charge(&account, amount, &reference))
            .await
            .map_err(|e| LedgerError::Database(format!("task join failed: {e}")))?
    }

    /// Async wrapper around [`Self::check_balance`].
    ///
    /// # Errors
    ///
    /// See [`Self::check_balance`].
    pub async fn check_balance_async(
        &self,
        account: &str,
        required: Decimal,
    ) -> Result<BalanceCheck, LedgerError> {
        let ledger = self.clone();
        let account = account.to_string();
        tokio::task::spawn_blocking(move || ledger.check_balance(&account, required))
            .await
            .map_err(|e| LedgerError::Database(format!("task join failed: {e}")))?
    }

    /// Async wrapper around [`Self::deposit`].
    ///
    /// # Errors
    ///
    /// See [`Self::deposit`].
    pub async fn deposit_async(
        &self,
        account: &str,
        amount: Decimal,
    ) -> Result<DepositReceipt, LedgerError> {
        let ledger = self.clone();
        let account = account.to_string();
        tokio::task::spawn_blocking(move || ledger.deposit(&account, amount))
            .await
            .map_err(|e| LedgerError::Database(format!("task join failed: {e}")))?
    }

    /// Async wrapper around [`Self::monthly_anchor_count`].
    ///
    /// # Errors
    ///
    /// See [`Self::monthly_anchor_count`].
    pub async fn monthly_anchor_count_async(&self, account: &str) -> Result<u64, LedgerError> {
        let ledger = self.clone();
        let account = account.to_string();
        tokio::task::spawn_blocking(move || ledger.monthly_anchor_count(&account))
            .await
            .map_err(|e| LedgerError::Database(format!("task join failed: {e}")))?
    }
}

/// Charge effects using an already-held connection inside an open
/// transaction, so the create path can combine the charge with the record
/// insert and commit them together.
pub(crate) fn charge_tx(
    conn: &Connection,
    account: &str,
    amount: Decimal,
    reference: &str,
    now: DateTime<Utc>,
) -> Result<ChargeReceipt, LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::NonPositiveAmount { amount });
    }

    let balance = read_balance(conn, account)?;
    if balance < amount {
        return Err(LedgerError::InsufficientBalance {
            balance,
            required: amount,
            shortfall: amount - balance,
        });
    }

    let remaining = balance - amount;
    conn.execute(
        "UPDATE account_billing SET balance = ?1 WHERE account_id = ?2",
        params![remaining.to_string(), account],
    )?;

    let transaction_id = new_transaction_id();
    conn.execute(
        "INSERT INTO transactions (id, account_id, amount, kind, status, reference_id, created_at) \
         VALUES (?1, ?2, ?3, 'charge', 'completed', ?4, ?5)",
        params![
            transaction_id,
            account,
            (-amount).to_string(),
            reference,
            judgment_core::record::rfc3339(now),
        ],
    )?;

    conn.execute(
        "INSERT INTO account_usage (account_id, day, anchor_count) VALUES (?1, ?2, 1) \
         ON CONFLICT (account_id, day) DO UPDATE SET anchor_count = anchor_count + 1",
        params![account, now.format("%Y-%m-%d").to_string()],
    )?;

    Ok(ChargeReceipt {
        charged: amount,
        remaining_balance: remaining,
        transaction_id,
    })
}

fn read_balance(conn: &Connection, account: &str) -> Result<Decimal, LedgerError> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT balance FROM account_billing WHERE account_id = ?1",
            params![account],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        None => Ok(Decimal::ZERO),
        Some(text) => text.parse().map_err(|e| LedgerError::CorruptBalance {
            account: account.to_string(),
            message: format!("{e}"),
        }),
    }
}

/// Commits on `Ok`, rolls back on `Err`. The rollback after a failed commit
/// is best-effort; the commit error wins.
fn finish_tx<T>(conn: &Connection, result: Result<T, LedgerError>) -> Result<T, LedgerError> {
    match result {
        Ok(value) => {
            conn.execute("COMMIT", []).map_err(|e| {
                let _ = conn.execute("ROLLBACK", []);
                LedgerError::Database(format!("commit failed (rolled back): {e}"))
            })?;
            Ok(value)
        },
        Err(error) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(error)
        },
    }
}

fn new_transaction_id() -> String {
    format!("txn_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn memory_ledger() -> BillingLedger {
        let conn = Connection::open_in_memory().unwrap();
        BillingLedger::new(Arc::new(Mutex::new(conn)), dec!(10), dec!(10000)).unwrap()
    }

    #[test]
    fn missing_account_reads_as_zero() {
        let ledger = memory_ledger();
        assert_eq!(ledger.balance("nobody").unwrap(), Decimal::ZERO);
    }

    #[test]
    fn deposit_then_charge_round_trip() {
        let ledger = memory_ledger();
        let receipt = ledger.deposit("acct", dec!(10)).unwrap();
        assert_eq!(receipt.new_balance, dec!(10));

        let charge = ledger.charge("acct", dec!(0.03), "jgd_1").unwrap();
        assert_eq!(charge.charged, dec!(0.03));
        assert_eq!(charge.remaining_balance, dec!(9.97));
        assert_eq!(ledger.balance("acct").unwrap(), dec!(9.97));
    }

    #[test]
    fn deposit_bounds_are_enforced() {
        let ledger = memory_ledger();
        assert!(matches!(
            ledger.deposit("acct", dec!(5)).unwrap_err(),
            LedgerError::DepositOutOfBounds { .. }
        ));
        assert!(matches!(
            ledger.deposit("acct", dec!(10001)).unwrap_err(),
            LedgerError::DepositOutOfBounds { .. }
        ));
        assert!(ledger.deposit("acct", dec!(10)).is_ok());
        assert!(ledger.deposit("acct", dec!(10000)).is_ok());
    }

    #[test]
    fn insufficient_charge_reports_shortfall_and_rolls_back() {
        let ledger = memory_ledger();
        ledger.ensure_account("acct").unwrap();
        // Hand-seed one cent so the shortfall is observable.
        {
            let conn = ledger.conn.lock().unwrap();
            conn.execute(
                "UPDATE account_billing SET balance = '0.01' WHERE account_id = 'acct'",
                [],
            )
            .unwrap();
        }

        let err = ledger.charge("acct", dec!(0.03), "jgd_1").unwrap_err();
        match err {
            LedgerError::InsufficientBalance {
                balance,
                required,
                shortfall,
            } => {
                assert_eq!(balance, dec!(0.01));
                assert_eq!(required, dec!(0.03));
                assert_eq!(shortfall, dec!(0.02));
            },
            other => panic!("expected InsufficientBalance, got {other:?}"),
        }

        // Nothing was applied: balance untouched, no transaction row, no
        // usage bump.
        assert_eq!(ledger.balance("acct").unwrap(), dec!(0.01));
        let conn = ledger.conn.lock().unwrap();
        let transactions: i64 = conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(transactions, 0);
        let usage: i64 = conn
            .query_row("SELECT COUNT(*) FROM account_usage", [], |row| row.get(0))
            .unwrap();
        assert_eq!(usage, 0);
    }

    #[test]
    fn check_balance_is_read_only() {
        let ledger = memory_ledger();
        ledger.deposit("acct", dec!(10)).unwrap();

        let check = ledger.check_balance("acct", dec!(25)).unwrap();
        assert!(!check.sufficient);
        assert_eq!(check.shortfall, dec!(15));
        assert_eq!(ledger.balance("acct").unwrap(), dec!(10));

        let ok = ledger.check_balance("acct", dec!(3)).unwrap();
        assert!(ok.sufficient);
        assert_eq!(ok.shortfall, Decimal::ZERO);
    }

    #[test]
    fn charges_bump_monthly_usage() {
        let ledger = memory_ledger();
        ledger.deposit("acct", dec!(10)).unwrap();

        for i in 0..3 {
            ledger.charge("acct", dec!(0.03), &format!("jgd_{i}")).unwrap();
        }
        assert_eq!(ledger.monthly_anchor_count("acct").unwrap(), 3);
        assert_eq!(ledger.monthly_anchor_count("other").unwrap(), 0);
    }

    #[test]
    fn usage_outside_current_month_is_not_counted() {
        let ledger = memory_ledger();
        {
            let conn = ledger.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO account_usage (account_id, day, anchor_count) \
                 VALUES ('acct', '2025-12-31', 500), ('acct', '2026-01-02', 7)",
                [],
            )
            .unwrap();
        }
        let now = DateTime::parse_from_rfc3339("2026-01-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(ledger.monthly_anchor_count_at("acct", now).unwrap(), 7);
    }

    #[test]
    fn rejects_non_positive_amounts() {
        let ledger = memory_ledger();
        ledger.deposit("acct", dec!(10)).unwrap();
        assert!(matches!(
            ledger.charge("acct", dec!(0), "jgd_1").unwrap_err(),
            LedgerError::NonPositiveAmount { .. }
        ));
        assert!(matches!(
            ledger.deposit("acct", dec!(-1)).unwrap_err(),
            LedgerError::NonPositiveAmount { .. }
        ));
    }

    #[test]
    fn balance_is_transaction_product_not_summation() {
        // The balance column is updated under the same transaction that
        // appends the row; reading it never recomputes a sum.
        let ledger = memory_ledger();
        ledger.deposit("acct", dec!(100)).unwrap();
        ledger.charge("acct", dec!(1.5), "jgd_a").unwrap();
        ledger.charge("acct", dec!(2.25), "jgd_b").unwrap();
        assert_eq!(ledger.balance("acct").unwrap(), dec!(96.25));

        let conn = ledger.conn.lock().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 3);
    }
}
