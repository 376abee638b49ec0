//! A single-slot rendezvous used to hand control between tasks.
//!
//! Unlike a queue, a `SignalSender::send` only returns once a receiver has
//! taken the signal *and* released the accompanying `Delivery`. The receiving
//! side can use that window to apply a state change that the sender must be
//! able to observe as soon as `send` returns.
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug, PartialEq, Eq)]
#[error("signal receiver is gone")]
pub struct SignalClosed;

/// Create a connected sender/receiver pair with at most one pending signal.
pub fn channel() -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::channel(1);

    (SignalSender { tx }, SignalReceiver { rx })
}

#[derive(Clone, Debug)]
pub struct SignalSender {
    tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl SignalSender {
    /// Send a signal and wait until it has been received and confirmed.
    ///
    /// Fails with `SignalClosed` if the receiver was dropped before confirming,
    /// in which case the signal is known not to have been handled.
    pub async fn send(&self) -> Result<(), SignalClosed> {
        let (ack_tx, ack_rx) = oneshot::channel();

        self.tx.send(ack_tx).await.map_err(|_| SignalClosed)?;

        ack_rx.await.map_err(|_| SignalClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct SignalReceiver {
    rx: mpsc::Receiver<oneshot::Sender<()>>,
}

impl SignalReceiver {
    /// Wait for the next signal. Returns `None` once every sender is dropped.
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await.map(Delivery::new)
    }

    /// Take a pending signal without waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok().map(Delivery::new)
    }
}

/// A received signal. The sender is released when this is confirmed or dropped.
#[derive(Debug)]
pub struct Delivery {
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    fn new(ack: oneshot::Sender<()>) -> Self {
        Self { ack: Some(ack) }
    }

    pub fn confirm(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(ack) = self.ack.take() {
            // The sender may have given up waiting, nothing to do then.
            _ = ack.send(());
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn send_waits_for_confirmation() {
        let (tx, mut rx) = channel();
        let applied = Arc::new(AtomicBool::new(false));

        let receiver_applied = applied.clone();
        let receiver = tokio::spawn(async move {
            let delivery = rx.recv().await.expect("signal was sent");
            tokio::time::sleep(Duration::from_millis(20)).await;
            receiver_applied.store(true, Ordering::SeqCst);
            delivery.confirm();
            rx
        });

        tx.send().await.expect("receiver is alive");
        assert!(applied.load(Ordering::SeqCst));

        drop(receiver.await.unwrap());
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (tx, rx) = channel();
        drop(rx);

        assert_eq!(tx.send().await, Err(SignalClosed));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn unreceived_signal_is_reported_closed() {
        let (tx, rx) = channel();

        let sender = tokio::spawn(async move { tx.send().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(rx);

        assert_eq!(sender.await.unwrap(), Err(SignalClosed));
    }

    #[tokio::test]
    async fn recv_returns_none_without_senders() {
        let (tx, mut rx) = channel();
        drop(tx);

        assert!(rx.recv().await.is_none());
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn try_recv_takes_pending_signal() {
        let (tx, mut rx) = channel();

        let sender = tokio::spawn(async move { tx.send().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let delivery = rx.try_recv().expect("a signal is pending");
        drop(delivery);

        assert_eq!(sender.await.unwrap(), Ok(()));
    }
}
