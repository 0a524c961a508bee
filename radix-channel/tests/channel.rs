//! Cross-thread channel tests: a requestor thread and a responder thread
//! exchanging traffic through the SPSC queues, waking each other only
//! through the control planes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use radix_channel::{
    CONTROL_QUEUE_DEPTH, Channel, ChannelConfig, ChannelId, ControlReceiver, DataDescriptor,
    Event, Responder, SendError, control_plane,
};

const MESSAGES: u64 = 10_000;

/// Runs the responder event loop until it has answered `expected`
/// requests and acknowledged close. Returns the handle and how many
/// control records it observed.
fn responder_loop(
    mut responder: Responder<u64>,
    mut control: ControlReceiver,
    expected: u64,
) -> (Responder<u64>, u64, u64) {
    let pending: Arc<Mutex<VecDeque<DataDescriptor<u64>>>> =
        Arc::new(Mutex::new(VecDeque::new()));
    let inbox = Arc::clone(&pending);
    responder.set_recv_request(Box::new(move |cd| {
        inbox.lock().unwrap().push_back(cd);
    }));

    let mut replied = 0u64;
    let mut records_seen = 0u64;

    loop {
        control.park_timeout(Duration::from_millis(1));

        let mut closing = false;
        while let Some(wire) = control.recv() {
            records_seen += 1;
            responder.service_kevent();
            match responder.service_message(Instant::now(), &wire) {
                Ok(Event::DataReadyResponder) => {
                    while responder.recv_request() {}
                }
                Ok(Event::Close) => closing = true,
                Ok(Event::Open) | Ok(Event::Noop) => {}
                Ok(event) => panic!("unexpected event at responder: {event:?}"),
                Err(err) => panic!("control record failed to parse: {err}"),
            }
        }

        // The wake-up may have been suppressed; drain regardless.
        while responder.recv_request() {}

        loop {
            let Some(request) = pending.lock().unwrap().pop_front() else {
                break;
            };
            let mut reply = DataDescriptor::new(Instant::now(), request.payload);
            reply.processing_time = Duration::from_micros(5);
            reply.cpu_time = Duration::from_micros(50);

            loop {
                match responder.send_reply(reply) {
                    Ok(()) => {
                        replied += 1;
                        break;
                    }
                    Err(SendError::Full(cd)) => {
                        reply = cd;
                        thread::yield_now();
                    }
                    Err(SendError::Inactive(_)) => {
                        panic!("channel closed with replies still owed");
                    }
                }
            }
        }

        if closing {
            // Close refuses further replies before any other bookkeeping.
            let refused = responder.send_reply(DataDescriptor::new(Instant::now(), 0));
            assert!(matches!(refused, Err(SendError::Inactive(_))));

            responder.responder_ack_close().unwrap();
            break;
        }

        if replied == expected {
            // Idle with everything answered; tell the requestor anyway and
            // keep waiting for the close.
            responder.responder_sleeping().unwrap();
        }
    }

    (responder, records_seen, replied)
}

#[test]
fn two_thread_round_trip_and_close() {
    let (req_tx, mut req_rx) = control_plane(CONTROL_QUEUE_DEPTH);
    let (resp_tx, resp_rx) = control_plane(CONTROL_QUEUE_DEPTH);

    let ch: Channel<u64> = Channel::create(req_tx, resp_tx, ChannelId(1));
    let (mut requestor, responder) = ch.split();

    let replies_seen = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&replies_seen);
    let mut expected_sequence = 0u64;
    requestor.set_recv_reply(Box::new(move |cd| {
        expected_sequence += 1;
        assert_eq!(cd.sequence(), expected_sequence, "replies out of order");
        counter.fetch_add(1, Ordering::Relaxed);
    }));

    let handle = thread::spawn(move || responder_loop(responder, resp_rx, MESSAGES));

    let mut req_records = 0u64;
    let service = |requestor: &mut radix_channel::Requestor<u64>,
                       control: &mut ControlReceiver,
                       records: &mut u64| {
        while let Some(wire) = control.recv() {
            *records += 1;
            requestor.service_kevent();
            match requestor.service_message(Instant::now(), &wire) {
                Ok(Event::DataReadyRequestor) => {
                    while requestor.recv_reply() {}
                }
                Ok(Event::Noop) | Ok(Event::Close) => {}
                Ok(event) => panic!("unexpected event at requestor: {event:?}"),
                Err(err) => panic!("control record failed to parse: {err}"),
            }
        }
    };

    for i in 0..MESSAGES {
        let mut cd = DataDescriptor::new(Instant::now(), i);
        loop {
            match requestor.send_request(cd) {
                Ok(()) => break,
                Err(SendError::Full(returned)) => {
                    cd = returned;
                    service(&mut requestor, &mut req_rx, &mut req_records);
                    req_rx.park_timeout(Duration::from_millis(1));
                }
                Err(SendError::Inactive(_)) => panic!("channel closed mid-run"),
            }
        }
        service(&mut requestor, &mut req_rx, &mut req_records);
    }

    while replies_seen.load(Ordering::Relaxed) < MESSAGES {
        req_rx.park_timeout(Duration::from_millis(1));
        service(&mut requestor, &mut req_rx, &mut req_records);
        while requestor.recv_reply() {}
    }

    let stats = requestor.stats();
    assert_eq!(stats.sequence, MESSAGES);
    assert_eq!(stats.ack, MESSAGES);
    assert_eq!(stats.num_outstanding, 0, "balanced run must settle to zero");
    assert!(stats.their_view_of_my_sequence <= stats.sequence);
    assert!(requestor.processing_time() > Duration::ZERO);

    // Close handshake: inactive immediately, acknowledged by the peer.
    requestor.signal_responder_close().unwrap();
    assert!(!requestor.active());

    let (responder, resp_records, replied) = handle.join().unwrap();
    assert_eq!(replied, MESSAGES);

    let resp_stats = responder.stats();
    assert_eq!(resp_stats.sequence, MESSAGES);
    assert_eq!(resp_stats.num_outstanding, 0);
    assert!(resp_stats.their_view_of_my_sequence <= resp_stats.sequence);

    // The ack-close record reaches the requestor's plane.
    let mut saw_close_ack = false;
    for _ in 0..100 {
        if let Some(wire) = req_rx.recv() {
            req_records += 1;
            if requestor.service_message(Instant::now(), &wire) == Ok(Event::Close) {
                saw_close_ack = true;
                break;
            }
        } else {
            req_rx.park_timeout(Duration::from_millis(1));
        }
    }
    assert!(saw_close_ack, "responder's close ack never arrived");

    // Every record observed was a recorded signal (plus the two close
    // records, which are not data signals).
    assert!(resp_records <= stats.num_signals + stats.num_resignals + 1);
    assert!(req_records <= resp_stats.num_signals + resp_stats.num_resignals + 1);
}

#[test]
fn small_queues_force_backpressure() {
    const COUNT: u64 = 2_000;

    let (req_tx, mut req_rx) = control_plane(CONTROL_QUEUE_DEPTH);
    let (resp_tx, resp_rx) = control_plane(CONTROL_QUEUE_DEPTH);

    let config = ChannelConfig {
        queue_depth: 4,
        ..ChannelConfig::default()
    };
    let ch: Channel<u64> = Channel::create_with_config(req_tx, resp_tx, ChannelId(2), config);
    let (mut requestor, responder) = ch.split();

    let replies_seen = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&replies_seen);
    requestor.set_recv_reply(Box::new(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    }));

    let handle = thread::spawn(move || responder_loop(responder, resp_rx, COUNT));

    let mut dropped_records = 0u64;
    for i in 0..COUNT {
        let mut cd = DataDescriptor::new(Instant::now(), i);
        loop {
            match requestor.send_request(cd) {
                Ok(()) => break,
                Err(SendError::Full(returned)) => {
                    cd = returned;
                    while let Some(wire) = req_rx.recv() {
                        let _ = requestor.service_message(Instant::now(), &wire);
                        while requestor.recv_reply() {}
                    }
                    req_rx.park_timeout(Duration::from_millis(1));
                }
                Err(SendError::Inactive(_)) => panic!("channel closed mid-run"),
            }
        }
    }

    while replies_seen.load(Ordering::Relaxed) < COUNT {
        req_rx.park_timeout(Duration::from_millis(1));
        while let Some(wire) = req_rx.recv() {
            dropped_records += 1;
            let _ = requestor.service_message(Instant::now(), &wire);
        }
        while requestor.recv_reply() {}
    }
    let _ = dropped_records;

    assert_eq!(requestor.stats().num_outstanding, 0);

    requestor.signal_responder_close().unwrap();
    let (_responder, _records, replied) = handle.join().unwrap();
    assert_eq!(replied, COUNT);
}
