// Divergence journal
// Process-local record of ledger entries whose balance update did not land

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use nexus_common::model::TransactionKind;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::LedgerRecordStatus;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DivergenceRecord {
    pub transaction_id: String,
    pub account_number: String,
    pub kind: TransactionKind,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub cause: String,
    pub ledger_record: LedgerRecordStatus,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded, append-only; the oldest records are evicted first
pub struct DivergenceJournal {
    capacity: usize,
    records: Mutex<VecDeque<DivergenceRecord>>,
    total: AtomicU64,
}

impl DivergenceJournal {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            total: AtomicU64::new(0),
        }
    }

    pub fn record(&self, record: DivergenceRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    /// Retained records, oldest first
    pub fn records(&self) -> Vec<DivergenceRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records ever appended, including evicted ones
    pub fn total_recorded(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}
