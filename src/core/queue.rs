//! Per-module bidirectional message queues.
//!
//! One queue pair connects a module to its local relay, multiplexing control
//! and data-add traffic. Queues are bounded: `send` blocks under
//! backpressure when the receiver lags, mirroring the behavior of a full OS
//! message queue.

use tokio::sync::mpsc;

use crate::core::codec::Frame;
use crate::core::message::{Buffer, Envelope, Payload};
use crate::{Error, Result};

/// One end of a bidirectional module queue.
pub struct MessageQueue {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

impl MessageQueue {
    /// Create a connected pair: (module end, relay end).
    pub fn pair(capacity: usize) -> (MessageQueue, MessageQueue) {
        let (to_relay, from_module) = mpsc::channel(capacity);
        let (to_module, from_relay) = mpsc::channel(capacity);
        (
            MessageQueue {
                tx: to_relay,
                rx: from_relay,
            },
            MessageQueue {
                tx: to_module,
                rx: from_module,
            },
        )
    }

    /// Queue a message; blocks when the peer's queue is full.
    pub async fn send(&self, envelope: &Envelope, payload: Option<Payload>) -> Result<()> {
        let buffer = Buffer::encode(envelope)?;
        let frame = match payload {
            Some(p) => Frame::with_payload(buffer, p),
            None => Frame::new(buffer),
        };
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Module("message queue peer is gone".to_string()))
    }

    /// Receive the next message; `None` when the peer disconnected.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// A clonable sender for fan-in routing.
    pub fn sender(&self) -> QueueSender {
        QueueSender {
            tx: self.tx.clone(),
        }
    }
}

/// Send-only handle onto a module queue.
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<Frame>,
}

impl QueueSender {
    pub async fn send(&self, envelope: &Envelope, payload: Option<Payload>) -> Result<()> {
        let buffer = Buffer::encode(envelope)?;
        let frame = match payload {
            Some(p) => Frame::with_payload(buffer, p),
            None => Frame::new(buffer),
        };
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Module("message queue peer is gone".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::MessageKind;
    use crate::core::message::ModuleId;

    #[tokio::test]
    async fn both_directions_carry_messages() {
        let (mut module_end, mut relay_end) = MessageQueue::pair(8);

        let to_relay = Envelope::new(ModuleId(5), 0, MessageKind::Busy { module: ModuleId(5) });
        module_end.send(&to_relay, None).await.unwrap();

        let got = relay_end.recv().await.unwrap();
        assert_eq!(got.buffer.decode().unwrap(), to_relay);

        let to_module = Envelope::new(
            ModuleId::LOCAL_HUB,
            0,
            MessageKind::Execute { module: ModuleId(5), generation: 1 },
        );
        relay_end.send(&to_module, None).await.unwrap();
        let got = module_end.recv().await.unwrap();
        assert_eq!(got.buffer.decode().unwrap().kind, to_module.kind);
    }

    #[tokio::test]
    async fn send_applies_backpressure() {
        let (module_end, mut relay_end) = MessageQueue::pair(1);
        let env = Envelope::new(ModuleId(1), 0, MessageKind::Quit);

        module_end.send(&env, None).await.unwrap();
        // The second send must wait until the relay drains one frame.
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            module_end.send(&env, None),
        )
        .await;
        assert!(pending.is_err());

        relay_end.recv().await.unwrap();
        module_end.send(&env, None).await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_is_observable() {
        let (module_end, relay_end) = MessageQueue::pair(2);
        let sender = relay_end.sender();
        drop(module_end);

        let env = Envelope::new(ModuleId::LOCAL_HUB, 0, MessageKind::Quit);
        assert!(sender.send(&env, None).await.is_err());
    }
}
