//! Shared test harness: an in-memory engine wired to a scripted transport.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use rust_decimal_macros::dec;

use judgment_core::pricing::PricingTable;
use judgment_core::record::{AnchorType, CreateRequest, ImmutabilityRequest};
use judgment_core::validation::RequestLimits;
use judgment_daemon::anchor::{AnchorService, AnchorTransport, TransportError};
use judgment_daemon::ledger::BillingLedger;
use judgment_daemon::service::JudgmentService;
use judgment_daemon::store::RecordStore;

/// Transport double: counts submissions and replays a scripted queue of
/// upgrade results.
pub struct ScriptedTransport {
    submits: AtomicUsize,
    fail_submit: AtomicBool,
    upgrades: Mutex<VecDeque<Result<Option<Vec<u8>>, TransportError>>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            submits: AtomicUsize::new(0),
            fail_submit: AtomicBool::new(false),
            upgrades: Mutex::new(VecDeque::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        let transport = Self::new();
        transport.fail_submit.store(true, Ordering::SeqCst);
        transport
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn push_upgrade(&self, result: Result<Option<Vec<u8>>, TransportError>) {
        self.upgrades.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl AnchorTransport for ScriptedTransport {
    fn kind(&self) -> AnchorType {
        AnchorType::Ots
    }

    async fn submit(&self, hash_hex: &str) -> Result<Vec<u8>, TransportError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(TransportError::Failed {
                message: "stamp rejected".to_string(),
            });
        }
        Ok(format!("pending:{hash_hex}").into_bytes())
    }

    async fn upgrade(&self, _proof: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        self.upgrades
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(None))
    }
}

/// An engine over one in-memory database. The low minimum deposit lets tests
/// seed arbitrary balances through the public API.
pub struct Engine {
    pub service: JudgmentService,
    pub store: RecordStore,
    pub ledger: BillingLedger,
}

pub fn engine(transport: Arc<dyn AnchorTransport>) -> Engine {
    let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
    let store = RecordStore::new(Arc::clone(&conn)).unwrap();
    let ledger = BillingLedger::new(Arc::clone(&conn), dec!(0.01), dec!(10000)).unwrap();
    let anchors = AnchorService::new().with_transport(transport);
    let service = JudgmentService::new(
        store.clone(),
        ledger.clone(),
        anchors,
        PricingTable::default_table(),
        RequestLimits::default(),
    );
    Engine {
        service,
        store,
        ledger,
    }
}

pub fn request(entity: &str, anchor: Option<&str>, key: Option<&str>) -> CreateRequest {
    CreateRequest {
        entity: entity.to_string(),
        action: "approved".to_string(),
        scope: Some(serde_json::json!({"case": "c-1"})),
        timestamp: None,
        immutability: anchor.map(|tag| ImmutabilityRequest {
            anchor_type: tag.to_string(),
            options: None,
        }),
        idempotency_key: key.map(ToString::to_string),
    }
}
