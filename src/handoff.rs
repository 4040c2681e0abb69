//! Rendezvous channel between pipeline stages.
//!
//! A send completes only once the receiving side has taken the item, so a
//! slow consumer stalls its producer instead of letting work pile up in a
//! queue.

use tokio::sync::{mpsc, oneshot};

/// The receiving side went away before taking the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Closed;

struct Parcel<T> {
    item: T,
    taken: oneshot::Sender<()>,
}

/// Sending half of a rendezvous channel.
pub(crate) struct Handoff<T> {
    tx: mpsc::Sender<Parcel<T>>,
}

/// Receiving half of a rendezvous channel.
pub(crate) struct Accept<T> {
    rx: mpsc::Receiver<Parcel<T>>,
}

/// Creates a rendezvous channel.
pub(crate) fn channel<T>() -> (Handoff<T>, Accept<T>) {
    let (tx, rx) = mpsc::channel(1);
    (Handoff { tx }, Accept { rx })
}

impl<T> Handoff<T> {
    /// Hands `item` over, waiting until the receiver has taken it.
    pub(crate) async fn send(&self, item: T) -> Result<(), Closed> {
        let (taken, accepted) = oneshot::channel();

        self.tx
            .send(Parcel { item, taken })
            .await
            .map_err(|_| Closed)?;

        accepted.await.map_err(|_| Closed)
    }
}

impl<T> Accept<T> {
    /// Takes the next item, releasing its sender.
    ///
    /// Returns `None` once every sender has been dropped.
    pub(crate) async fn recv(&mut self) -> Option<T> {
        let Parcel { item, taken } = self.rx.recv().await?;

        // The sender may have given up waiting; the item is still ours.
        let _ = taken.send(());
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn send_waits_for_receiver() {
        let (tx, mut rx) = channel::<u32>();

        let sender = tokio::spawn(async move { tx.send(7).await });

        // Nobody has received yet, so the send must still be pending.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished());

        assert_eq!(rx.recv().await, Some(7));

        let result = timeout(Duration::from_secs(1), sender)
            .await
            .expect("sender should complete")
            .unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn items_arrive_in_order() {
        let (tx, mut rx) = channel::<u32>();

        tokio::spawn(async move {
            for i in 0..5 {
                tx.send(i).await.unwrap();
            }
        });

        let mut received = Vec::new();
        while let Some(i) = rx.recv().await {
            received.push(i);
        }

        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (tx, rx) = channel::<u32>();
        drop(rx);

        assert_eq!(tx.send(1).await, Err(Closed));
    }

    #[tokio::test]
    async fn recv_ends_when_sender_dropped() {
        let (tx, mut rx) = channel::<u32>();
        drop(tx);

        assert_eq!(rx.recv().await, None);
    }
}
