//! Offline record store.
//!
//! Each device keeps the donation records it could not deliver in a
//! [`RecordStore`]. Records are appended when created and removed from the
//! front only after the server has taken them, so delivery is always attempted
//! oldest first.

use std::collections::VecDeque;

use chrono::{DateTime, Local};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{printable, FormatVariant};

/// A rendered donation message waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationRecord {
    /// Identifier used in logs and events
    pub id: Uuid,

    /// Barcode layout the message was rendered with
    pub variant: FormatVariant,

    /// Wire bytes, fixed at creation
    pub message: Vec<u8>,

    /// When the record was created
    pub created_at: DateTime<Local>,
}

impl DonationRecord {
    pub fn new(variant: FormatVariant, message: Vec<u8>, created_at: DateTime<Local>) -> Self {
        Self {
            id: Uuid::new_v4(),
            variant,
            message,
            created_at,
        }
    }

    /// The message with reserved bytes made visible, for logging.
    pub fn printable(&self) -> String {
        printable(&self.message)
    }
}

/// Errors from record store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Tried to remove a record from an empty store
    #[error("record store is empty")]
    Empty,
}

/// Counters over the lifetime of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Total number of records appended
    pub records_stored: u64,

    /// Total number of records removed after delivery
    pub records_removed: u64,
}

/// FIFO queue of undelivered donation records.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: VecDeque<DonationRecord>,
    stats: StoreStats,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record at the back of the queue.
    pub fn append(&mut self, record: DonationRecord) {
        self.stats.records_stored += 1;
        self.records.push_back(record);
    }

    /// The oldest record, if any.
    pub fn peek_oldest(&self) -> Option<&DonationRecord> {
        self.records.front()
    }

    /// Remove and return the oldest record.
    pub fn remove_oldest(&mut self) -> Result<DonationRecord, StoreError> {
        let record = self.records.pop_front().ok_or(StoreError::Empty)?;
        self.stats.records_removed += 1;
        Ok(record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &DonationRecord> {
        self.records.iter()
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(variant: FormatVariant, tag: &str) -> DonationRecord {
        DonationRecord::new(variant, tag.as_bytes().to_vec(), Local::now())
    }

    #[test]
    fn test_fifo_order() {
        let mut store = RecordStore::new();
        let r1 = record(FormatVariant::AllBarcodes, "r1");
        let r2 = record(FormatVariant::NoBarcodes, "r2");
        let r3 = record(FormatVariant::RequiredOnly, "r3");

        store.append(r1.clone());
        store.append(r2.clone());
        store.append(r3.clone());
        assert_eq!(store.len(), 3);

        assert_eq!(store.remove_oldest().unwrap(), r1);
        assert_eq!(store.remove_oldest().unwrap(), r2);
        assert_eq!(store.peek_oldest(), Some(&r3));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_empty_store() {
        let mut store = RecordStore::new();
        assert!(store.is_empty());
        assert!(store.peek_oldest().is_none());
        assert_eq!(store.remove_oldest(), Err(StoreError::Empty));
        assert_eq!(store.stats().records_removed, 0);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut store = RecordStore::new();
        let r1 = record(FormatVariant::RequiredWithLot, "r1");
        store.append(r1.clone());

        assert_eq!(store.peek_oldest(), Some(&r1));
        assert_eq!(store.peek_oldest(), Some(&r1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_iter_oldest_first() {
        let mut store = RecordStore::new();
        for tag in ["a", "b", "c"] {
            store.append(record(FormatVariant::AllBarcodes, tag));
        }
        let tags: Vec<&[u8]> = store.iter().map(|r| r.message.as_slice()).collect();
        assert_eq!(tags, vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
    }

    #[test]
    fn test_stats() {
        let mut store = RecordStore::new();
        store.append(record(FormatVariant::AllBarcodes, "a"));
        store.append(record(FormatVariant::AllBarcodes, "b"));
        store.remove_oldest().unwrap();

        assert_eq!(
            store.stats(),
            &StoreStats {
                records_stored: 2,
                records_removed: 1,
            }
        );
    }

    #[test]
    fn test_record_ids_are_unique() {
        let a = record(FormatVariant::AllBarcodes, "x");
        let b = record(FormatVariant::AllBarcodes, "x");
        assert_ne!(a.id, b.id);
    }
}
