//! Unbounded, order-preserving hand-off between one producer side and one
//! consumer.
//!
//! The queue is a single dedicated task owning a `VecDeque`, coordinated
//! entirely by message passing. Each iteration of its service loop offers
//! three mutually exclusive operations: accept a new value, deliver the
//! head element to the consumer, or observe the close request. It takes
//! whichever becomes ready, close first. Senders are therefore always
//! eventually accepted while the queue is open (there is no "full"), and
//! the consumer pends only while the queue is empty.
//!
//! Used by the stream reader to keep a slow consumer from ever blocking
//! the tasks draining the backend's pipes.

use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};

/// Handle for enqueueing into (and closing) a FIFO opened with [`open`].
///
/// Cheap to clone; all clones feed the same queue.
pub struct Fifo<T> {
    input: mpsc::Sender<T>,
    close: mpsc::Sender<oneshot::Sender<()>>,
}

/// Consumer half of a FIFO opened with [`open`].
pub struct FifoReceiver<T> {
    output: mpsc::Receiver<T>,
}

/// Opens a FIFO and activates its service task.
pub fn open<T: Send + 'static>() -> (Fifo<T>, FifoReceiver<T>) {
    let (input_tx, input_rx) = mpsc::channel(1);
    let (output_tx, output_rx) = mpsc::channel(1);
    let (close_tx, close_rx) = mpsc::channel(1);
    tokio::spawn(service(input_rx, output_tx, close_rx));
    (
        Fifo {
            input: input_tx,
            close: close_tx,
        },
        FifoReceiver { output: output_rx },
    )
}

impl<T> Clone for Fifo<T> {
    fn clone(&self) -> Self {
        Self {
            input: self.input.clone(),
            close: self.close.clone(),
        }
    }
}

impl<T: Send + 'static> Fifo<T> {
    /// Enqueues a value. Returns `false` once the queue has been closed.
    pub async fn send(&self, value: T) -> bool {
        self.input.send(value).await.is_ok()
    }

    /// Signals shutdown and waits for the service task to exit.
    ///
    /// Values already queued are still delivered to the consumer before
    /// the service task exits, unless the consumer has gone away. Safe to
    /// call on an empty queue and safe to call twice; the second call
    /// returns immediately.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.close.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

impl<T> FifoReceiver<T> {
    /// Receives the next value in strict enqueue order, pending while the
    /// queue is empty. Returns `None` once the queue is closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.output.recv().await
    }
}

async fn service<T>(
    mut input: mpsc::Receiver<T>,
    output: mpsc::Sender<T>,
    mut close: mpsc::Receiver<oneshot::Sender<()>>,
) {
    let mut queue: VecDeque<T> = VecDeque::new();
    let mut input_open = true;
    let mut close_open = true;
    let ack = loop {
        // Close takes priority: a busy producer/consumer pair must not be
        // able to starve it. All handles dropped without an explicit close
        // means drain what is queued, then exit.
        tokio::select! {
            biased;
            req = close.recv(), if close_open => match req {
                Some(ack) => break Some(ack),
                None => close_open = false,
            },
            value = input.recv(), if input_open => match value {
                Some(value) => queue.push_back(value),
                None => input_open = false,
            },
            permit = output.reserve(), if !queue.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(value) = queue.pop_front() {
                        permit.send(value);
                    }
                }
                // Consumer dropped its half; nothing left to deliver to.
                Err(_) => break None,
            },
        }
        if !input_open && queue.is_empty() {
            break None;
        }
    };
    // Flush whatever is still queued; the consumer dropping its half is
    // the only reason to abandon it.
    while let Some(value) = queue.pop_front() {
        match output.reserve().await {
            Ok(permit) => permit.send(value),
            Err(_) => break,
        }
    }
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Item {
        Int(i64),
        Str(&'static str),
        Flag(bool),
    }

    #[tokio::test]
    async fn preserves_enqueue_order() {
        let (fifo, mut rx) = open();
        assert!(fifo.send(Item::Int(1)).await);
        assert!(fifo.send(Item::Str("aaa")).await);
        assert!(fifo.send(Item::Flag(true)).await);

        assert_eq!(rx.recv().await, Some(Item::Int(1)));
        assert_eq!(rx.recv().await, Some(Item::Str("aaa")));
        assert_eq!(rx.recv().await, Some(Item::Flag(true)));
        fifo.close().await;
    }

    #[tokio::test]
    async fn order_holds_under_concurrent_producer_and_consumer() {
        let (fifo, mut rx) = open();
        let producer = {
            let fifo = fifo.clone();
            tokio::spawn(async move {
                for i in 0..1000u32 {
                    assert!(fifo.send(i).await);
                }
            })
        };
        for i in 0..1000u32 {
            assert_eq!(rx.recv().await, Some(i));
        }
        producer.await.unwrap();
        fifo.close().await;
    }

    #[tokio::test]
    async fn close_on_empty_queue_returns() {
        let (fifo, mut rx) = open::<u8>();
        fifo.close().await;
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (fifo, _rx) = open();
        fifo.close().await;
        assert!(!fifo.send(1u8).await);
    }

    #[tokio::test]
    async fn dropping_all_handles_ends_the_output() {
        let (fifo, mut rx) = open();
        assert!(fifo.send(7u8).await);
        drop(fifo);
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, None);
    }
}
