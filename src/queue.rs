//! Per-source FIFO of items fetched but not yet delivered.

use crate::error::QueueError;
use crate::models::Item;
use std::collections::{HashSet, VecDeque};

/// How many delivered ids stay in the seen set.
const DELIVERED_HISTORY: usize = 64;

/// Items waiting for delivery, oldest first, plus the ids already taken in.
///
/// An id stays in the seen set after its item is committed, so a page that
/// flips back to an earlier "latest" item does not re-queue it. Only the last
/// [`DELIVERED_HISTORY`] delivered ids are kept; pending ids are always kept.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: VecDeque<Item>,
    seen: HashSet<String>,
    delivered: VecDeque<String>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `item` unless its id was already taken in.
    ///
    /// # Returns
    ///
    /// `true` if the item was appended.
    pub fn enqueue(&mut self, item: Item) -> bool {
        if !self.seen.insert(item.id.clone()) {
            return false;
        }
        self.items.push_back(item);
        true
    }

    pub fn peek_oldest(&self) -> Option<&Item> {
        self.items.front()
    }

    /// Remove the head item after it was delivered.
    pub fn commit_oldest(&mut self) -> Result<Item, QueueError> {
        let item = self.items.pop_front().ok_or(QueueError::Empty)?;
        self.delivered.push_back(item.id.clone());
        if self.delivered.len() > DELIVERED_HISTORY {
            if let Some(expired) = self.delivered.pop_front() {
                self.seen.remove(&expired);
            }
        }
        Ok(item)
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
