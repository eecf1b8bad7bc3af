//! Bounded in-process channels connecting tasks.
//!
//! A configured capacity of zero means unbounded. The null sender is for
//! tasks that do not fan out: it accepts sends cheaply as no-ops while still
//! yielding to the scheduler.

use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
#[error("channel closed")]
pub struct ChannelClosed;

pub enum Sender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
    Null,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Bounded(tx) => Self::Bounded(tx.clone()),
            Self::Unbounded(tx) => Self::Unbounded(tx.clone()),
            Self::Null => Self::Null,
        }
    }
}

impl<T: Send> Sender<T> {
    /// Send a value, suspending while a bounded channel is full.
    pub async fn send(&self, value: T) -> Result<(), ChannelClosed> {
        match self {
            Self::Bounded(tx) => tx.send(value).await.map_err(|_| ChannelClosed),
            Self::Unbounded(tx) => tx.send(value).map_err(|_| ChannelClosed),
            Self::Null => {
                tokio::task::yield_now().await;
                Ok(())
            }
        }
    }
}

pub enum Receiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> Receiver<T> {
    /// `None` once every sender has been dropped and the channel is drained.
    pub async fn recv(&mut self) -> Option<T> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// A connected pair; capacity zero yields an unbounded channel.
pub fn channel<T>(capacity: u64) -> (Sender<T>, Receiver<T>) {
    if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (Sender::Unbounded(tx), Receiver::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(capacity as usize);
        (Sender::Bounded(tx), Receiver::Bounded(rx))
    }
}

pub fn null_sender<T>() -> Sender<T> {
    Sender::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_arrive_in_fifo_order() {
        let (tx, mut rx) = channel::<u32>(4);
        for i in 0..4 {
            tx.send(i).await.unwrap();
        }
        for i in 0..4 {
            assert_eq!(rx.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn receiver_drains_after_all_senders_close() {
        let (tx, mut rx) = channel::<u32>(0);
        let tx2 = tx.clone();
        tx.send(1).await.unwrap();
        tx2.send(2).await.unwrap();
        drop(tx);
        drop(tx2);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn bounded_sender_suspends_until_receiver_is_ready() {
        let (tx, mut rx) = channel::<u32>(1);
        tx.send(1).await.unwrap();

        let pending = tokio::spawn(async move {
            tx.send(2).await.unwrap();
        });
        // The second send is blocked until we drain one value.
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert_eq!(rx.recv().await, Some(1));
        pending.await.unwrap();
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn null_sender_accepts_everything() {
        let tx = null_sender::<u32>();
        let tx2 = tx.clone();
        tx.send(1).await.unwrap();
        tx2.send(2).await.unwrap();
    }
}
