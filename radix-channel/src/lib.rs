//! Bidirectional request/reply channel between exactly two threads.
//!
//! A channel connects a *requestor* (network I/O) with a *responder*
//! (worker). Each direction is a bounded lock-free SPSC queue of
//! [`DataDescriptor`]s; an out-of-band control plane carries small
//! wake-up records so a sleeping peer notices queued work. The channel
//! itself never blocks and takes no locks; all waiting happens outside,
//! on the control plane.
//!
//! ```text
//!  requestor thread                         responder thread
//!  ┌──────────────┐   requests (SPSC)       ┌──────────────┐
//!  │  Requestor   │ ──────────────────────► │  Responder   │
//!  │              │ ◄────────────────────── │              │
//!  └──────┬───────┘   replies (SPSC)        └──────┬───────┘
//!         │                                        │
//!         └────► responder's control plane ◄───────┘
//!                (wake-up records only)
//! ```
//!
//! # Signal suppression
//!
//! Waking the peer costs a syscall; queueing a descriptor costs a store.
//! Each end therefore tracks its own `sequence`, the peer's `ack`, and,
//! through an atomic published on every receive, the peer's view of its
//! sequence. A reply send signals unconditionally when the responder
//! drains to zero outstanding requests, and otherwise skips the wake-up
//! while the requestor has not yet caught up with the previous signal.
//! Suppression is a heuristic: delivery correctness never depends on it,
//! because the descriptor is already queued before any signalling
//! decision is made.
//!
//! # Splitting
//!
//! [`Channel::create`] builds the unsplit channel, which is also the
//! same-thread fast path: its `send_request`/`send_reply` invoke the
//! installed receive callbacks synchronously with no queue traffic.
//! [`Channel::split`] turns it into the two single-owner handles used
//! across threads; each handle is `Send` and owned by exactly one thread,
//! so every counter is single-writer by construction.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

mod control;

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use radix_queue::{Consumer, Full, Producer};
use tracing::trace;

pub use control::{
    CONTROL_MSG_SIZE, CONTROL_QUEUE_DEPTH, ControlMessage, ControlReceiver, ControlSender, Signal,
    control_plane,
};

/// Depth of each direction's descriptor queue.
///
/// The reader must service its queue at inter-packet latency; erring on
/// the high side trades memory for push-failure headroom.
pub const DATA_QUEUE_DEPTH: usize = 1024;

/// Inverse alpha of the exponential moving averages (intervals and
/// processing time): `new = (sample + 7 * old) / 8`.
const INVERSE_ALPHA: u32 = 8;

#[inline]
fn ema(old: Duration, sample: Duration) -> Duration {
    (sample + old * (INVERSE_ALPHA - 1)) / INVERSE_ALPHA
}

/// Identifies a channel in control records.
///
/// Assigned by the coordinator that creates the channel; travels through
/// the control plane so the servicing thread can route the record back to
/// its channel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(
    /// The raw identifier value.
    pub u64,
);

/// The two directions of a channel, also used to identify the closing
/// side in close records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Direction {
    /// Requestor to responder.
    ToResponder = 0,
    /// Responder to requestor.
    ToRequestor = 1,
}

/// Events produced by the control-message demultiplexer.
///
/// The first five values share the numeric space of [`Signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Event {
    /// Transport-level failure.
    Error = 0,
    /// The responder should drain its request queue.
    DataReadyResponder = 1,
    /// The requestor should drain its reply queue.
    DataReadyRequestor = 2,
    /// A new channel has been handed off.
    Open = 3,
    /// The channel should be closed.
    Close = 4,
    /// Nothing to do.
    Noop = 5,
}

/// Packet priority buckets for traffic flowing through a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Must be processed immediately.
    Now,
    /// Ahead of normal traffic.
    High,
    /// The default.
    Normal,
    /// Behind everything else.
    Low,
}

impl Priority {
    /// The configuration name of this priority.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Now => "now",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "now" => Self::Now,
            "high" => Self::High,
            "normal" => Self::Normal,
            "low" => Self::Low,
            _ => return Err(ChannelError::UnknownPriority),
        })
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from channel control paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// A control record had the wrong size.
    BadMessageSize(usize),
    /// A control record carried an unknown signal value.
    UnknownSignal(u32),
    /// A control record was routed to the wrong channel.
    WrongChannel {
        /// The channel the record was delivered to.
        expected: ChannelId,
        /// The channel the record named.
        got: ChannelId,
    },
    /// The control plane could not accept a record.
    Transport,
    /// A signal arrived at an end that never receives it.
    UnexpectedSignal(Signal),
    /// Not a recognised priority name.
    UnknownPriority,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMessageSize(size) => {
                write!(f, "control message of {size} bytes, expected {CONTROL_MSG_SIZE}")
            }
            Self::UnknownSignal(value) => write!(f, "unknown control signal {value}"),
            Self::WrongChannel { expected, got } => {
                write!(f, "control message for channel {} routed to {}", got.0, expected.0)
            }
            Self::Transport => write!(f, "control plane rejected the record"),
            Self::UnexpectedSignal(signal) => {
                write!(f, "signal {signal:?} arrived at the wrong end")
            }
            Self::UnknownPriority => write!(f, "not a recognised priority name"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Error returned by `send_request`/`send_reply`; carries the descriptor
/// back so the caller can retry on another channel or apply backpressure.
pub enum SendError<T> {
    /// The outbound queue is saturated.
    Full(DataDescriptor<T>),
    /// The channel is closing.
    Inactive(DataDescriptor<T>),
}

impl<T> SendError<T> {
    /// Returns the descriptor that could not be sent.
    pub fn into_inner(self) -> DataDescriptor<T> {
        match self {
            Self::Full(cd) | Self::Inactive(cd) => cd,
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "descriptor queue is full"),
            Self::Inactive(_) => write!(f, "channel is not active"),
        }
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<T> std::error::Error for SendError<T> {}

// ============================================================================
// Descriptors and configuration
// ============================================================================

/// The unit of traffic through a channel.
///
/// The channel treats the payload as opaque; it owns only the timestamp,
/// the sequence/ack pair it assigns on send, and the responder timing
/// fields on replies.
pub struct DataDescriptor<T> {
    /// When the data became ready, from the monotonic clock.
    pub when: Instant,
    /// Responder time spent producing this reply; zero marks a NAK and is
    /// excluded from the round-trip average.
    pub processing_time: Duration,
    /// Total responder CPU time reported with this reply.
    pub cpu_time: Duration,
    sequence: u64,
    ack: u64,
    /// The payload.
    pub payload: T,
}

impl<T> DataDescriptor<T> {
    /// Creates a descriptor; sequence and ack are assigned on send.
    pub fn new(when: Instant, payload: T) -> Self {
        Self {
            when,
            processing_time: Duration::ZERO,
            cpu_time: Duration::ZERO,
            sequence: 0,
            ack: 0,
            payload,
        }
    }

    /// The sequence number assigned when this descriptor was sent.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The sender's acknowledgement state when this descriptor was sent.
    #[inline]
    pub fn ack(&self) -> u64 {
        self.ack
    }
}

impl<T: fmt::Debug> fmt::Debug for DataDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataDescriptor")
            .field("sequence", &self.sequence)
            .field("ack", &self.ack)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Receive callback, invoked by the draining end with the popped
/// descriptor. Context travels by closure capture.
pub type RecvCallback<T> = Box<dyn FnMut(DataDescriptor<T>) + Send>;

/// Channel tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Depth of each direction's descriptor queue.
    pub queue_depth: usize,
    /// Enables the richer send-side suppression predicates.
    ///
    /// Experimental: the conservative default is the only configuration
    /// the protocol invariants are asserted against.
    pub enable_skips: bool,
    /// Minimum interval between responder data signals, applied on top of
    /// the catch-up check. Experimental, off by default.
    pub signal_interval: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_depth: DATA_QUEUE_DEPTH,
            enable_skips: false,
            signal_interval: None,
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// The only state both threads touch.
struct Shared {
    /// Cleared by either side's close call; read by both.
    active: AtomicBool,
    /// Per direction: the producer's sequence as last seen by the peer's
    /// reader. Written on receive, read by the producer to suppress
    /// wake-ups. A heuristic only; staleness is harmless.
    their_view: [CachePadded<AtomicU64>; 2],
}

/// Single-owner bookkeeping for one end of the channel.
struct EndState {
    sequence: u64,
    ack: u64,
    sequence_at_last_signal: u64,
    num_outstanding: u64,
    num_packets: u64,
    num_signals: u64,
    num_resignals: u64,
    num_kevents: u64,
    must_signal: bool,
    last_write: Instant,
    last_read_other: Instant,
    last_sent_signal: Instant,
    message_interval: Duration,
}

impl EndState {
    fn new(now: Instant) -> Self {
        Self {
            sequence: 0,
            ack: 0,
            sequence_at_last_signal: 0,
            num_outstanding: 0,
            num_packets: 0,
            num_signals: 0,
            num_resignals: 0,
            num_kevents: 0,
            must_signal: false,
            last_write: now,
            last_read_other: now,
            last_sent_signal: now,
            message_interval: Duration::ZERO,
        }
    }
}

/// Counter snapshot for one end; see [`Requestor::stats`] and
/// [`Responder::stats`].
#[derive(Debug, Clone, Copy)]
pub struct EndStats {
    /// Sequence number of the last descriptor sent from this end.
    pub sequence: u64,
    /// Sequence number of the last descriptor received on this end.
    pub ack: u64,
    /// Requests sent but not yet answered (requestor), or received but
    /// not yet answered (responder).
    pub num_outstanding: u64,
    /// Descriptors sent from this end.
    pub num_packets: u64,
    /// Wake-up records sent from this end.
    pub num_signals: u64,
    /// Wake-ups re-sent after observing the peer behind or idle.
    pub num_resignals: u64,
    /// Control-plane events serviced for this end.
    pub num_kevents: u64,
    /// This end's sequence as last seen by the peer.
    pub their_view_of_my_sequence: u64,
}

// ============================================================================
// Channel
// ============================================================================

/// An unsplit channel: both ends in one place.
///
/// This is the same-thread fast path: sends invoke the peer's receive
/// callback synchronously, with no queue traffic and no counters. Call
/// [`split`](Channel::split) to produce the two cross-thread handles.
pub struct Channel<T> {
    requestor: Requestor<T>,
    responder: Responder<T>,
}

impl<T> Channel<T> {
    /// Creates a channel with default configuration.
    ///
    /// `requestor_control` signals the requestor's thread and is held by
    /// the responder end; `responder_control` the reverse. Both ends'
    /// clocks are seeded with the current time, and the channel starts
    /// active.
    pub fn create(
        requestor_control: ControlSender,
        responder_control: ControlSender,
        id: ChannelId,
    ) -> Self {
        Self::create_with_config(
            requestor_control,
            responder_control,
            id,
            ChannelConfig::default(),
        )
    }

    /// Creates a channel with explicit configuration.
    pub fn create_with_config(
        requestor_control: ControlSender,
        responder_control: ControlSender,
        id: ChannelId,
        config: ChannelConfig,
    ) -> Self {
        let now = Instant::now();

        let shared = Arc::new(Shared {
            active: AtomicBool::new(true),
            their_view: [
                CachePadded::new(AtomicU64::new(0)),
                CachePadded::new(AtomicU64::new(0)),
            ],
        });

        let (requests_tx, requests_rx) = radix_queue::queue(config.queue_depth);
        let (replies_tx, replies_rx) = radix_queue::queue(config.queue_depth);

        Self {
            requestor: Requestor {
                id,
                config,
                shared: Arc::clone(&shared),
                end: EndState::new(now),
                requests: requests_tx,
                replies: replies_rx,
                control: responder_control,
                recv_reply: None,
                context: None,
                processing_time: Duration::ZERO,
                cpu_time: Duration::ZERO,
            },
            responder: Responder {
                id,
                config,
                shared,
                end: EndState::new(now),
                replies: replies_tx,
                requests: requests_rx,
                control: requestor_control,
                recv_request: None,
                context: None,
            },
        }
    }

    /// Splits the channel into its two single-owner handles.
    pub fn split(self) -> (Requestor<T>, Responder<T>) {
        (self.requestor, self.responder)
    }

    /// The channel's identifier.
    #[inline]
    pub fn id(&self) -> ChannelId {
        self.requestor.id
    }

    /// Returns `true` while neither side has initiated close.
    #[inline]
    pub fn active(&self) -> bool {
        self.requestor.active()
    }

    /// Installs the callback invoked with each received reply.
    pub fn set_recv_reply(&mut self, callback: RecvCallback<T>) {
        self.requestor.set_recv_reply(callback);
    }

    /// Installs the callback invoked with each received request.
    pub fn set_recv_request(&mut self, callback: RecvCallback<T>) {
        self.responder.set_recv_request(callback);
    }

    /// Same-thread request: invokes the request callback synchronously.
    pub fn send_request(&mut self, cd: DataDescriptor<T>) -> Result<(), SendError<T>> {
        let recv = self
            .responder
            .recv_request
            .as_mut()
            .expect("receive callback not installed");
        recv(cd);
        Ok(())
    }

    /// Same-thread reply: invokes the reply callback synchronously.
    ///
    /// Fails once the channel is closing, exactly as the cross-thread
    /// path does.
    pub fn send_reply(&mut self, cd: DataDescriptor<T>) -> Result<(), SendError<T>> {
        if !self.active() {
            return Err(SendError::Inactive(cd));
        }
        let recv = self
            .requestor
            .recv_reply
            .as_mut()
            .expect("receive callback not installed");
        recv(cd);
        Ok(())
    }

    /// Advances the responder sequence without delivering anything.
    ///
    /// Used when a request is dropped rather than answered; runs in both
    /// the same-thread and cross-thread modes.
    pub fn null_reply(&mut self) {
        self.responder.null_reply();
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.requestor.id)
            .field("active", &self.active())
            .field("to_responder", &self.requestor.stats())
            .field("to_requestor", &self.responder.stats())
            .finish()
    }
}

// ============================================================================
// Requestor
// ============================================================================

/// The requestor end: submits work, consumes replies.
///
/// `Send` but single-owner; exactly one thread drives it.
pub struct Requestor<T> {
    id: ChannelId,
    config: ChannelConfig,
    shared: Arc<Shared>,
    end: EndState,
    /// Outbound requests.
    requests: Producer<DataDescriptor<T>>,
    /// Inbound replies.
    replies: Consumer<DataDescriptor<T>>,
    /// The responder thread's control plane.
    control: ControlSender,
    recv_reply: Option<RecvCallback<T>>,
    context: Option<Box<dyn Any + Send>>,
    /// Moving average of responder processing time, from replies.
    processing_time: Duration,
    /// Latest responder CPU time, from replies.
    cpu_time: Duration,
}

impl<T> Requestor<T> {
    /// The channel's identifier.
    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Returns `true` while neither side has initiated close.
    #[inline]
    pub fn active(&self) -> bool {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Installs the callback invoked with each received reply.
    ///
    /// Must be installed before any traffic flows.
    pub fn set_recv_reply(&mut self, callback: RecvCallback<T>) {
        self.recv_reply = Some(callback);
    }

    /// Attaches requestor-side context.
    pub fn set_context(&mut self, context: Box<dyn Any + Send>) {
        self.context = Some(context);
    }

    /// Returns the attached context, if it has the expected type.
    pub fn context<U: Any>(&self) -> Option<&U> {
        self.context.as_deref().and_then(|c| c.downcast_ref())
    }

    /// Sends a request into the channel.
    ///
    /// Assigns sequence and ack, queues the descriptor, then wakes the
    /// responder; transport errors on the wake-up are ignored because the
    /// descriptor is already queued. On a full queue, drains any pending
    /// replies and hands the descriptor back.
    pub fn send_request(&mut self, mut cd: DataDescriptor<T>) -> Result<(), SendError<T>> {
        let when = cd.when;
        let sequence = self.end.sequence + 1;
        cd.sequence = sequence;
        cd.ack = self.end.ack;

        if let Err(Full(cd)) = self.requests.push(cd) {
            while self.recv_reply() {}
            return Err(SendError::Full(cd));
        }

        self.end.sequence = sequence;

        let sample = when.saturating_duration_since(self.end.last_write);
        if self.end.message_interval == Duration::ZERO {
            self.end.message_interval = sample;
        } else {
            self.end.message_interval = ema(self.end.message_interval, sample);
        }

        debug_assert!(self.end.last_write <= when, "writes must be monotone");
        self.end.last_write = when;

        self.end.num_outstanding += 1;
        self.end.num_packets += 1;

        if self.config.enable_skips && self.end.num_outstanding > 1 {
            // Old packets are outstanding; look for replies, then skip the
            // wake-up unless the demultiplexer demanded one.
            while self.recv_reply() {}
            if !self.end.must_signal {
                trace!(channel = self.id.0, "requestor skips signal");
                return Ok(());
            }
        }

        let _ = self.data_ready(when, Signal::DataToResponder);
        Ok(())
    }

    /// Drains one reply, updating timing averages and acknowledgement
    /// state and invoking the reply callback.
    ///
    /// Returns `false` when the reply queue is empty.
    pub fn recv_reply(&mut self) -> bool {
        let Some(cd) = self.replies.pop() else {
            return false;
        };

        // NAKs report zero processing time; keep them out of the average.
        if cd.processing_time != Duration::ZERO {
            self.processing_time = ema(self.processing_time, cd.processing_time);
        }
        self.cpu_time = cd.cpu_time;

        debug_assert!(self.end.num_outstanding > 0, "reply with nothing outstanding");
        debug_assert!(cd.sequence > self.end.ack, "reply sequence must advance");
        debug_assert!(
            cd.sequence <= self.end.sequence,
            "cannot have more replies than requests"
        );

        self.end.num_outstanding -= 1;
        self.end.ack = cd.sequence;
        self.shared.their_view[Direction::ToResponder as usize]
            .store(cd.ack, Ordering::Release);

        debug_assert!(self.end.last_read_other <= cd.when, "reads must be monotone");
        self.end.last_read_other = cd.when;

        let recv = self
            .recv_reply
            .as_mut()
            .expect("receive callback not installed");
        recv(cd);

        true
    }

    /// Demultiplexes a control record delivered to the requestor thread.
    ///
    /// Passthrough signals return their event directly. The two
    /// responder-origin signals additionally mean the responder has been
    /// observed behind or idle, so the responder is unconditionally
    /// re-woken and the next send will not suppress its signal.
    pub fn service_message(&mut self, now: Instant, data: &[u8]) -> Result<Event, ChannelError> {
        let message = ControlMessage::decode(data)?;
        if message.channel != self.id {
            return Err(ChannelError::WrongChannel {
                expected: self.id,
                got: message.channel,
            });
        }

        if let Some(event) = message.signal.passthrough() {
            return Ok(event);
        }

        let event = match message.signal {
            Signal::DataDoneResponder => Event::DataReadyRequestor,
            Signal::ResponderSleeping => Event::Noop,
            _ => unreachable!("passthrough handled above"),
        };
        self.end.must_signal = true;

        if self.config.enable_skips && message.ack == self.end.sequence {
            // The responder has seen everything we queued.
            trace!(channel = self.id.0, "requestor skips resignal");
            return Ok(event);
        }

        self.end.num_resignals += 1;
        trace!(channel = self.id.0, signal = ?message.signal, "requestor resignals responder");
        self.data_ready(now, Signal::DataToResponder)?;

        Ok(event)
    }

    /// Accounts one control-plane event serviced for this end.
    #[inline]
    pub fn service_kevent(&mut self) {
        self.end.num_kevents += 1;
    }

    /// Announces this channel to the responder's thread.
    pub fn signal_open(&mut self) -> Result<(), ChannelError> {
        self.control.send(&ControlMessage {
            signal: Signal::Open,
            ack: 0,
            channel: self.id,
        })
    }

    /// Initiates the close handshake from the requestor side.
    ///
    /// The channel goes inactive immediately; it must be kept alive until
    /// the responder acknowledges and all queued descriptors drain.
    pub fn signal_responder_close(&mut self) -> Result<(), ChannelError> {
        self.shared.active.store(false, Ordering::Relaxed);
        trace!(channel = self.id.0, "requestor signals close");
        self.control.send(&ControlMessage {
            signal: Signal::Close,
            ack: Direction::ToResponder as u64,
            channel: self.id,
        })
    }

    /// Counter snapshot for this end.
    pub fn stats(&self) -> EndStats {
        EndStats {
            sequence: self.end.sequence,
            ack: self.end.ack,
            num_outstanding: self.end.num_outstanding,
            num_packets: self.end.num_packets,
            num_signals: self.end.num_signals,
            num_resignals: self.end.num_resignals,
            num_kevents: self.end.num_kevents,
            their_view_of_my_sequence: self.shared.their_view
                [Direction::ToResponder as usize]
                .load(Ordering::Acquire),
        }
    }

    /// Moving average of responder processing time.
    #[inline]
    pub fn processing_time(&self) -> Duration {
        self.processing_time
    }

    /// Latest responder CPU time.
    #[inline]
    pub fn cpu_time(&self) -> Duration {
        self.cpu_time
    }

    /// Moving average of the interval between outbound requests.
    #[inline]
    pub fn message_interval(&self) -> Duration {
        self.end.message_interval
    }

    /// Sends a wake-up record and records the signalling state.
    fn data_ready(&mut self, when: Instant, signal: Signal) -> Result<(), ChannelError> {
        self.end.last_sent_signal = when;
        self.end.num_signals += 1;
        self.end.must_signal = false;
        self.end.sequence_at_last_signal = self.end.sequence;

        trace!(channel = self.id.0, ?signal, "requestor signals");
        self.control.send(&ControlMessage {
            signal,
            ack: self.end.ack,
            channel: self.id,
        })
    }
}

impl<T> fmt::Debug for Requestor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requestor")
            .field("id", &self.id)
            .field("active", &self.active())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Responder
// ============================================================================

/// The responder end: consumes work, submits replies.
///
/// `Send` but single-owner; exactly one thread drives it.
pub struct Responder<T> {
    id: ChannelId,
    config: ChannelConfig,
    shared: Arc<Shared>,
    end: EndState,
    /// Outbound replies.
    replies: Producer<DataDescriptor<T>>,
    /// Inbound requests.
    requests: Consumer<DataDescriptor<T>>,
    /// The requestor thread's control plane.
    control: ControlSender,
    recv_request: Option<RecvCallback<T>>,
    context: Option<Box<dyn Any + Send>>,
}

impl<T> Responder<T> {
    /// The channel's identifier.
    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Returns `true` while neither side has initiated close.
    #[inline]
    pub fn active(&self) -> bool {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Installs the callback invoked with each received request.
    ///
    /// Must be installed before any traffic flows.
    pub fn set_recv_request(&mut self, callback: RecvCallback<T>) {
        self.recv_request = Some(callback);
    }

    /// Attaches responder-side context.
    pub fn set_context(&mut self, context: Box<dyn Any + Send>) {
        self.context = Some(context);
    }

    /// Returns the attached context, if it has the expected type.
    pub fn context<U: Any>(&self) -> Option<&U> {
        self.context.as_deref().and_then(|c| c.downcast_ref())
    }

    /// Sends a reply into the channel.
    ///
    /// Refused once the channel is inactive. After queueing, newly
    /// arrived requests are drained opportunistically; then the requestor
    /// is woken: unconditionally when nothing is outstanding any more,
    /// otherwise only if it has caught up with the previous signal.
    pub fn send_reply(&mut self, mut cd: DataDescriptor<T>) -> Result<(), SendError<T>> {
        if !self.active() {
            return Err(SendError::Inactive(cd));
        }

        let when = cd.when;
        let sequence = self.end.sequence + 1;
        cd.sequence = sequence;
        cd.ack = self.end.ack;

        if let Err(Full(cd)) = self.replies.push(cd) {
            while self.recv_request() {}
            return Err(SendError::Full(cd));
        }

        debug_assert!(self.end.num_outstanding > 0, "reply with nothing outstanding");
        self.end.num_outstanding -= 1;
        self.end.num_packets += 1;

        self.end.sequence = sequence;
        let sample = when.saturating_duration_since(self.end.last_write);
        self.end.message_interval = ema(self.end.message_interval, sample);

        debug_assert!(self.end.last_write <= when, "writes must be monotone");
        self.end.last_write = when;

        // Even if we think we are drained, the requestor may have queued
        // more while we worked.
        while self.recv_request() {}

        if self.end.num_outstanding == 0 {
            let _ = self.data_ready(when, Signal::DataDoneResponder);
            return Ok(());
        }

        let their_view =
            self.shared.their_view[Direction::ToRequestor as usize].load(Ordering::Acquire);

        if self.end.sequence_at_last_signal > their_view {
            // The requestor has not caught up with the previous wake-up.
            trace!(channel = self.id.0, "responder skips signal");
            return Ok(());
        }

        debug_assert!(their_view <= self.end.sequence);

        if let Some(interval) = self.config.signal_interval {
            if self.end.sequence - their_view <= 1000
                && (when.saturating_duration_since(self.end.last_read_other) < interval
                    || when.saturating_duration_since(self.end.last_sent_signal) < interval)
            {
                trace!(channel = self.id.0, "responder skips signal inside interval");
                return Ok(());
            }
        }

        let _ = self.data_ready(when, Signal::DataToRequestor);
        Ok(())
    }

    /// Advances the responder sequence without delivering anything.
    ///
    /// Used when a request is dropped rather than answered.
    #[inline]
    pub fn null_reply(&mut self) {
        self.end.sequence += 1;
    }

    /// Drains one request, updating acknowledgement state and invoking
    /// the request callback.
    ///
    /// Returns `false` when the request queue is empty.
    pub fn recv_request(&mut self) -> bool {
        let Some(cd) = self.requests.pop() else {
            return false;
        };

        debug_assert!(cd.sequence > self.end.ack, "request sequence must advance");
        debug_assert!(
            cd.sequence >= self.end.sequence,
            "cannot have more replies than requests"
        );

        self.end.num_outstanding += 1;
        self.end.ack = cd.sequence;
        self.shared.their_view[Direction::ToRequestor as usize]
            .store(cd.ack, Ordering::Release);

        debug_assert!(self.end.last_read_other <= cd.when, "reads must be monotone");
        self.end.last_read_other = cd.when;

        let recv = self
            .recv_request
            .as_mut()
            .expect("receive callback not installed");
        recv(cd);

        true
    }

    /// Tells the requestor this thread is going idle with work still
    /// outstanding, so it will be re-woken. A no-op when nothing is
    /// outstanding, since the requestor already knows.
    pub fn responder_sleeping(&mut self) -> Result<(), ChannelError> {
        if self.end.num_outstanding == 0 {
            return Ok(());
        }

        self.end.num_signals += 1;
        trace!(
            channel = self.id.0,
            outstanding = self.end.num_outstanding,
            "responder sleeping"
        );
        self.control.send(&ControlMessage {
            signal: Signal::ResponderSleeping,
            ack: self.end.ack,
            channel: self.id,
        })
    }

    /// Demultiplexes a control record delivered to the responder thread.
    ///
    /// Only passthrough signals arrive here; the responder-origin signals
    /// are delivered to the requestor.
    pub fn service_message(&mut self, _now: Instant, data: &[u8]) -> Result<Event, ChannelError> {
        let message = ControlMessage::decode(data)?;
        if message.channel != self.id {
            return Err(ChannelError::WrongChannel {
                expected: self.id,
                got: message.channel,
            });
        }

        message
            .signal
            .passthrough()
            .ok_or(ChannelError::UnexpectedSignal(message.signal))
    }

    /// Accounts one control-plane event serviced for this end.
    #[inline]
    pub fn service_kevent(&mut self) {
        self.end.num_kevents += 1;
    }

    /// Acknowledges the close handshake from the responder side.
    pub fn responder_ack_close(&mut self) -> Result<(), ChannelError> {
        self.shared.active.store(false, Ordering::Relaxed);
        trace!(channel = self.id.0, "responder acknowledges close");
        self.control.send(&ControlMessage {
            signal: Signal::Close,
            ack: Direction::ToRequestor as u64,
            channel: self.id,
        })
    }

    /// Counter snapshot for this end.
    pub fn stats(&self) -> EndStats {
        EndStats {
            sequence: self.end.sequence,
            ack: self.end.ack,
            num_outstanding: self.end.num_outstanding,
            num_packets: self.end.num_packets,
            num_signals: self.end.num_signals,
            num_resignals: self.end.num_resignals,
            num_kevents: self.end.num_kevents,
            their_view_of_my_sequence: self.shared.their_view
                [Direction::ToRequestor as usize]
                .load(Ordering::Acquire),
        }
    }

    /// Moving average of the interval between outbound replies.
    #[inline]
    pub fn message_interval(&self) -> Duration {
        self.end.message_interval
    }

    /// Sends a wake-up record and records the signalling state.
    fn data_ready(&mut self, when: Instant, signal: Signal) -> Result<(), ChannelError> {
        self.end.last_sent_signal = when;
        self.end.num_signals += 1;
        self.end.must_signal = false;
        self.end.sequence_at_last_signal = self.end.sequence;

        trace!(channel = self.id.0, ?signal, "responder signals");
        self.control.send(&ControlMessage {
            signal,
            ack: self.end.ack,
            channel: self.id,
        })
    }
}

impl<T> fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("id", &self.id)
            .field("active", &self.active())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
