//! Control-plane plumbing: small fixed-size wake-up records.
//!
//! Bulk data moves through the SPSC descriptor queues; the control plane
//! only tells a thread that *something happened* on a channel. Each
//! thread owns one [`ControlReceiver`] that its event loop drains, and
//! hands a [`ControlSender`] to every peer that may need to wake it. The
//! wake itself is a park/unpark token, standing in for an
//! event-notification descriptor.
//!
//! Records are serialized to a fixed 20-byte little-endian layout so the
//! transport stays payload-agnostic:
//!
//! ```text
//! ┌─────────────┬──────────────────┬──────────────────────┐
//! │ signal: u32 │ ack: u64         │ channel: u64         │
//! └─────────────┴──────────────────┴──────────────────────┘
//! ```

use std::time::Duration;

use crossbeam_utils::sync::{Parker, Unparker};
use radix_queue::{Consumer, Producer};

use crate::{ChannelError, ChannelId};

/// Size of a serialized control record.
pub const CONTROL_MSG_SIZE: usize = 20;

/// Depth of a control-plane ring; comfortably more than one record per
/// in-flight descriptor.
pub const CONTROL_QUEUE_DEPTH: usize = 1024;

/// Signals carried by control records.
///
/// The first five values coincide with the [`Event`](crate::Event) enum
/// and pass through the demultiplexer unchanged; the last two exist only
/// on the wire and are mapped on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Signal {
    /// Transport-level failure.
    Error = 0,
    /// The requestor queued work.
    DataToResponder = 1,
    /// The responder queued a reply.
    DataToRequestor = 2,
    /// A new channel has been handed off.
    Open = 3,
    /// Close initiated; the `ack` field carries the closing side.
    Close = 4,
    /// The responder drained its queue.
    DataDoneResponder = 5,
    /// The responder is idle with work still outstanding.
    ResponderSleeping = 6,
}

impl Signal {
    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Error,
            1 => Self::DataToResponder,
            2 => Self::DataToRequestor,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::DataDoneResponder,
            6 => Self::ResponderSleeping,
            _ => return None,
        })
    }

    /// The event this signal maps to directly, for the five signals that
    /// share the event numeric space.
    pub(crate) fn passthrough(self) -> Option<crate::Event> {
        Some(match self {
            Self::Error => crate::Event::Error,
            Self::DataToResponder => crate::Event::DataReadyResponder,
            Self::DataToRequestor => crate::Event::DataReadyRequestor,
            Self::Open => crate::Event::Open,
            Self::Close => crate::Event::Close,
            Self::DataDoneResponder | Self::ResponderSleeping => return None,
        })
    }
}

/// A control record: `(signal, ack, channel)`.
///
/// The meaning of `ack` depends on the signal: a sequence acknowledgement
/// for data signals, the closing side for [`Signal::Close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    /// The signal to deliver.
    pub signal: Signal,
    /// Acknowledgement state, or the closing side for close signals.
    pub ack: u64,
    /// The channel the record belongs to.
    pub channel: ChannelId,
}

impl ControlMessage {
    /// Serializes to the fixed wire layout.
    pub fn encode(&self) -> [u8; CONTROL_MSG_SIZE] {
        let mut buf = [0u8; CONTROL_MSG_SIZE];
        buf[0..4].copy_from_slice(&(self.signal as u32).to_le_bytes());
        buf[4..12].copy_from_slice(&self.ack.to_le_bytes());
        buf[12..20].copy_from_slice(&self.channel.0.to_le_bytes());
        buf
    }

    /// Parses a record of exactly [`CONTROL_MSG_SIZE`] bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ChannelError> {
        if data.len() != CONTROL_MSG_SIZE {
            return Err(ChannelError::BadMessageSize(data.len()));
        }

        let raw = u32::from_le_bytes(data[0..4].try_into().expect("sized slice"));
        let signal = Signal::from_u32(raw).ok_or(ChannelError::UnknownSignal(raw))?;
        let ack = u64::from_le_bytes(data[4..12].try_into().expect("sized slice"));
        let channel = u64::from_le_bytes(data[12..20].try_into().expect("sized slice"));

        Ok(Self {
            signal,
            ack,
            channel: ChannelId(channel),
        })
    }
}

/// Creates a control plane for one thread: a sender to hand to peers and
/// the receiver its event loop drains.
pub fn control_plane(capacity: usize) -> (ControlSender, ControlReceiver) {
    let (tx, rx) = radix_queue::queue(capacity);
    let parker = Parker::new();
    let wake = parker.unparker().clone();

    (
        ControlSender { queue: tx, wake },
        ControlReceiver { queue: rx, parker },
    )
}

/// The signalling half of a control plane, held by the peer thread.
#[derive(Debug)]
pub struct ControlSender {
    queue: Producer<[u8; CONTROL_MSG_SIZE]>,
    wake: Unparker,
}

impl ControlSender {
    /// Queues a record and wakes the owning thread.
    ///
    /// A full ring means the receiver has stopped servicing its control
    /// plane; that is a transport failure, not backpressure.
    pub fn send(&mut self, message: &ControlMessage) -> Result<(), ChannelError> {
        self.queue
            .push(message.encode())
            .map_err(|_| ChannelError::Transport)?;
        self.wake.unpark();
        Ok(())
    }
}

/// The receiving half of a control plane, owned by the thread it wakes.
#[derive(Debug)]
pub struct ControlReceiver {
    queue: Consumer<[u8; CONTROL_MSG_SIZE]>,
    parker: Parker,
}

impl ControlReceiver {
    /// Pops the next raw record, if any.
    pub fn recv(&mut self) -> Option<[u8; CONTROL_MSG_SIZE]> {
        self.queue.pop()
    }

    /// Blocks until a sender wakes this thread.
    ///
    /// Returns immediately if a wake token is already pending.
    pub fn park(&self) {
        self.parker.park();
    }

    /// As [`park`](Self::park), with an upper bound on the wait.
    pub fn park_timeout(&self, timeout: Duration) {
        self.parker.park_timeout(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let msg = ControlMessage {
            signal: Signal::DataToRequestor,
            ack: 0xDEAD_BEEF_0042,
            channel: ChannelId(7),
        };

        let wire = msg.encode();
        assert_eq!(ControlMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_wrong_size() {
        let err = ControlMessage::decode(&[0u8; 19]).unwrap_err();
        assert!(matches!(err, ChannelError::BadMessageSize(19)));
    }

    #[test]
    fn decode_rejects_unknown_signal() {
        let mut wire = [0u8; CONTROL_MSG_SIZE];
        wire[0..4].copy_from_slice(&99u32.to_le_bytes());
        let err = ControlMessage::decode(&wire).unwrap_err();
        assert!(matches!(err, ChannelError::UnknownSignal(99)));
    }

    #[test]
    fn send_queues_and_wakes() {
        let (mut tx, mut rx) = control_plane(8);

        let msg = ControlMessage {
            signal: Signal::Open,
            ack: 0,
            channel: ChannelId(1),
        };
        tx.send(&msg).unwrap();

        // A wake token is pending, so this does not block.
        rx.park();

        let wire = rx.recv().expect("record queued");
        assert_eq!(ControlMessage::decode(&wire).unwrap(), msg);
        assert!(rx.recv().is_none());
    }

    #[test]
    fn full_ring_is_a_transport_error() {
        let (mut tx, _rx) = control_plane(2);

        let msg = ControlMessage {
            signal: Signal::DataToResponder,
            ack: 0,
            channel: ChannelId(1),
        };
        tx.send(&msg).unwrap();
        tx.send(&msg).unwrap();
        assert!(matches!(tx.send(&msg), Err(ChannelError::Transport)));
    }

    #[test]
    fn cross_thread_wake() {
        let (mut tx, mut rx) = control_plane(8);

        let handle = std::thread::spawn(move || {
            rx.park();
            rx.recv()
        });

        std::thread::sleep(Duration::from_millis(20));
        tx.send(&ControlMessage {
            signal: Signal::DataToResponder,
            ack: 3,
            channel: ChannelId(9),
        })
        .unwrap();

        let wire = handle.join().unwrap().expect("record queued");
        let msg = ControlMessage::decode(&wire).unwrap();
        assert_eq!(msg.ack, 3);
        assert_eq!(msg.channel, ChannelId(9));
    }
}
