use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::protocol::ConversionResponse;

/// Outstanding requests keyed by sequence number.
///
/// Every entry is removed exactly once: by [`PendingTable::deliver`] when
/// the matching response arrives, or by one of the cancellation paths.
/// Removing an entry without delivering drops its sender, so the waiting
/// caller observes a closed channel instead of hanging.
#[derive(Default, Clone)]
pub struct PendingTable {
    inner: Arc<DashMap<u64, oneshot::Sender<ConversionResponse>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Register a sequence number and obtain the receiver for its response.
    pub fn register(&self, sequence: u64) -> oneshot::Receiver<ConversionResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(sequence, tx);
        rx
    }

    /// Hand a response to the entry with the same sequence number.
    pub fn deliver(&self, response: ConversionResponse) -> Result<u64, DeliveryError> {
        let sequence = response.sequence.ok_or(DeliveryError::Unsequenced)?;
        match self.inner.remove(&sequence) {
            Some((_sequence, sender)) => sender
                .send(response)
                .map(|()| sequence)
                .map_err(|_| DeliveryError::ChannelClosed { sequence }),
            None => Err(DeliveryError::Stale { sequence }),
        }
    }

    /// Drop one entry without resolving it.
    pub fn remove(&self, sequence: u64) -> bool {
        self.inner.remove(&sequence).is_some()
    }

    /// Drop every entry without resolving any. Returns how many were removed.
    pub fn cancel_all(&self) -> usize {
        let sequences: Vec<u64> = self.inner.iter().map(|entry| *entry.key()).collect();
        sequences
            .into_iter()
            .filter(|sequence| self.inner.remove(sequence).is_some())
            .count()
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.inner.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("response carries no sequence number")]
    Unsequenced,
    #[error("no pending request for sequence {sequence}")]
    Stale { sequence: u64 },
    #[error("caller for sequence {sequence} stopped waiting")]
    ChannelClosed { sequence: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(sequence: u64, html: &str) -> ConversionResponse {
        ConversionResponse::rendered(Some(sequence), html.to_string(), false)
    }

    #[tokio::test]
    async fn delivers_by_sequence_regardless_of_order() {
        let table = PendingTable::new();
        let first = table.register(1);
        let second = table.register(2);

        assert_eq!(table.deliver(response(2, "two")), Ok(2));
        assert_eq!(table.deliver(response(1, "one")), Ok(1));

        assert_eq!(first.await.expect("first").html.as_deref(), Some("one"));
        assert_eq!(second.await.expect("second").html.as_deref(), Some("two"));
        assert!(table.is_empty());
    }

    #[test]
    fn entries_are_removed_exactly_once() {
        let table = PendingTable::new();
        let _receiver = table.register(4);

        assert_eq!(table.deliver(response(4, "a")), Ok(4));
        assert_eq!(
            table.deliver(response(4, "b")),
            Err(DeliveryError::Stale { sequence: 4 })
        );
    }

    #[test]
    fn unsequenced_responses_are_rejected() {
        let table = PendingTable::new();
        let malformed = ConversionResponse {
            sequence: None,
            ok: false,
            html: None,
            error: Some("bad".to_string()),
            degraded: false,
        };
        assert_eq!(table.deliver(malformed), Err(DeliveryError::Unsequenced));
    }

    #[tokio::test]
    async fn cancel_all_drops_callers_without_resolving() {
        let table = PendingTable::new();
        let first = table.register(1);
        let second = table.register(2);

        assert_eq!(table.cancel_all(), 2);
        assert_eq!(table.cancel_all(), 0);
        assert!(first.await.is_err());
        assert!(second.await.is_err());
        assert_eq!(
            table.deliver(response(1, "late")),
            Err(DeliveryError::Stale { sequence: 1 })
        );
    }

    #[test]
    fn abandoned_receivers_report_closed_channels() {
        let table = PendingTable::new();
        drop(table.register(7));
        assert_eq!(
            table.deliver(response(7, "x")),
            Err(DeliveryError::ChannelClosed { sequence: 7 })
        );
        assert!(!table.contains(7));
    }
}
