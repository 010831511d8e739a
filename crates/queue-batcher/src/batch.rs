//! Partitioning of payload lists into provider-sized batches.
//!
//! A batch call may carry at most the provider cap of entries (10 for SQS),
//! and every entry needs an identifier that is unique within its call. The
//! partitioner chunks a list in order and hands each chunk a fresh pool of
//! identifiers `0..len`, consumed from the end so the first item receives
//! the highest id. Ids are not stable across calls and mean nothing outside
//! the batch that carries them.

use crate::error::QueueError;
use crate::message::{BatchEntry, PayloadItem};

#[cfg(test)]
#[path = "batch_tests.rs"]
mod tests;

/// An ordered group of entries sent in one provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    index: usize,
    entries: Vec<BatchEntry>,
}

impl Batch {
    /// Build a batch from payload items, assigning batch-local identifiers
    ///
    /// # Errors
    ///
    /// Returns `BatchTooLarge` when `items` exceeds `max_size`, or a
    /// serialization error when a record cannot be rendered as text.
    pub fn new(index: usize, items: &[PayloadItem], max_size: usize) -> Result<Self, QueueError> {
        if items.len() > max_size {
            return Err(QueueError::BatchTooLarge {
                size: items.len(),
                max_size,
            });
        }

        let mut ids = IdPool::new(items.len());
        let entries = items
            .iter()
            .map_while(|item| ids.take().map(|id| (id, item)))
            .map(|(id, item)| Ok(BatchEntry::new(id, item.to_body()?)))
            .collect::<Result<Vec<_>, QueueError>>()?;
        debug_assert!(ids.is_exhausted());

        Ok(Self { index, entries })
    }

    /// Position of this batch within the partitioned payload
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Split `items` into consecutive batches of at most `max_size` entries
///
/// Relative order is preserved inside every batch and batches are numbered
/// in the order their items appear. An empty list yields no batches.
pub fn partition(items: &[PayloadItem], max_size: usize) -> Result<Vec<Batch>, QueueError> {
    if max_size == 0 {
        return Err(QueueError::BatchTooLarge {
            size: items.len(),
            max_size,
        });
    }

    items
        .chunks(max_size)
        .enumerate()
        .map(|(index, chunk)| Batch::new(index, chunk, max_size))
        .collect()
}

/// Number of batches `count` items occupy
pub fn batch_count(count: usize, max_size: usize) -> usize {
    if max_size == 0 {
        return 0;
    }
    count.div_ceil(max_size)
}

/// Single-use pool of batch-local identifiers
struct IdPool {
    ids: Vec<usize>,
}

impl IdPool {
    fn new(len: usize) -> Self {
        Self {
            ids: (0..len).collect(),
        }
    }

    fn take(&mut self) -> Option<String> {
        self.ids.pop().map(|id| id.to_string())
    }

    fn is_exhausted(&self) -> bool {
        self.ids.is_empty()
    }
}
