//! Cancellable packet queue between the transport and the fold loop
//!
//! A spawned producer drains the transport stream into a bounded channel; the
//! consumer pulls one item at a time. Both sides watch the same cancellation
//! token, so a stop ends the turn at the next pull without surfacing an error.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConversationError, ConversationResult};
use crate::packets::StreamItem;
use crate::transport::PacketStream;

/// Outcome of one pull
#[derive(Debug)]
pub enum FifoItem {
    Item(StreamItem),
    /// The transport failed; nothing follows
    Failed(ConversationError),
    /// The token fired; treat as a silent end
    Cancelled,
    /// The stream ended normally
    Closed,
}

/// Bounded FIFO fed by a producer task
#[derive(Debug)]
pub struct PacketFifo {
    receiver: mpsc::Receiver<ConversationResult<StreamItem>>,
    cancel: CancellationToken,
    producer: JoinHandle<()>,
}

impl PacketFifo {
    /// Start draining `stream` into a queue of at most `capacity` items
    pub fn spawn(stream: PacketStream, cancel: CancellationToken, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let token = cancel.clone();
        let producer = tokio::spawn(async move {
            let mut stream = stream;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = stream.next() => next,
                };
                let Some(item) = next else {
                    break;
                };
                let failed = item.is_err();
                if sender.send(item).await.is_err() || failed {
                    break;
                }
            }
            debug!("packet producer finished");
        });
        Self {
            receiver,
            cancel,
            producer,
        }
    }

    /// Pull the next item in arrival order
    pub async fn next(&mut self) -> FifoItem {
        if self.cancel.is_cancelled() {
            return FifoItem::Cancelled;
        }
        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return FifoItem::Cancelled,
            received = self.receiver.recv() => received,
        };
        match received {
            Some(Ok(item)) => FifoItem::Item(item),
            Some(Err(err)) if err.is_cancellation() => FifoItem::Cancelled,
            Some(Err(err)) => FifoItem::Failed(err),
            None if self.cancel.is_cancelled() => FifoItem::Cancelled,
            None => FifoItem::Closed,
        }
    }
}

impl Drop for PacketFifo {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::Packet;
    use futures::stream;

    fn items(texts: &[&str]) -> PacketStream {
        let items: Vec<ConversationResult<StreamItem>> = texts
            .iter()
            .enumerate()
            .map(|(ind, text)| Ok(StreamItem::Packet(Packet::message_delta(ind as i64, *text))))
            .collect();
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_items_arrive_in_order() {
        let mut fifo = PacketFifo::spawn(items(&["a", "b", "c"]), CancellationToken::new(), 1);
        let mut seen = Vec::new();
        loop {
            match fifo.next().await {
                FifoItem::Item(StreamItem::Packet(packet)) => seen.push(packet.ind),
                FifoItem::Closed => break,
                other => panic!("unexpected item: {:?}", other),
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancel_ends_silently() {
        let token = CancellationToken::new();
        let mut fifo = PacketFifo::spawn(
            stream::pending::<ConversationResult<StreamItem>>().boxed(),
            token.clone(),
            4,
        );
        token.cancel();
        assert!(matches!(fifo.next().await, FifoItem::Cancelled));
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let failing: Vec<ConversationResult<StreamItem>> = vec![
            Ok(StreamItem::Packet(Packet::message_delta(0, "a"))),
            Err(ConversationError::transport("connection reset")),
        ];
        let mut fifo = PacketFifo::spawn(stream::iter(failing).boxed(), CancellationToken::new(), 4);
        assert!(matches!(fifo.next().await, FifoItem::Item(_)));
        match fifo.next().await {
            FifoItem::Failed(err) => assert!(err.to_string().contains("connection reset")),
            other => panic!("unexpected item: {:?}", other),
        }
    }
}
