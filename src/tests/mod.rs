use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use hex_literal::hex;

use crate::frame::{self, Begin, Body, Frame, Open, Performative};
use crate::{
    Condition, Connection, DeliveryState, EndpointState, ErrorCondition, IllegalState, LinkHandle,
    Role, SaslCode, Target, Transport, TransportConfig, TransportError, AMQP_HEADER, SASL_HEADER,
};

mod util;
use util::{drain_frames, subscribe, Pair};

#[test]
fn header_is_the_first_output() {
    let _guard = subscribe();
    // queued spontaneously, before anything is even bound
    let mut t = Transport::new(TransportConfig::default());
    assert_eq!(t.pending(), 8);
    assert_eq!(t.head()[..8], AMQP_HEADER);
}

#[test]
fn open_handshake() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    assert_eq!(pair.server_conn().remote_container_id(), Some("client"));
    assert_eq!(pair.client_conn().remote_container_id(), Some("server"));
}

#[test]
fn begin_before_open_is_a_violation() {
    let _guard = subscribe();
    let mut t = Transport::new(TransportConfig::default());
    t.bind(Connection::new("server"));
    let begin = frame::encode(
        &Frame::amqp(
            1,
            Performative::Begin(Begin {
                remote_channel: None,
                next_outgoing_id: 0,
                incoming_window: 10,
                outgoing_window: 10,
                handle_max: 7,
            }),
        ),
        u32::MAX,
    )
    .unwrap();
    let mut bytes = AMQP_HEADER.to_vec();
    bytes.extend_from_slice(&begin);

    let err = t.input(&bytes).unwrap_err();
    assert_matches!(err, TransportError::Violation(_));
    assert!(!t.is_handling_frames());
    assert_eq!(t.connection().unwrap().state(), EndpointState::Closed);

    // the peer gets told why
    let frames = drain_frames(&mut t);
    let close = frames
        .iter()
        .find_map(|f| match &f.body {
            Body::Amqp(Some(Performative::Close(close))) => Some(close.clone()),
            _ => None,
        })
        .expect("violation must produce a close frame");
    assert_eq!(close.error.unwrap().condition, Condition::ILLEGAL_STATE);
}

#[test]
fn credit_is_enforced() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let (sender, receiver) = pair.sender_link(5);

    for i in 0..5u8 {
        pair.client_conn()
            .transfer(sender, vec![i], b"hello".as_slice())
            .unwrap();
    }
    let err = pair
        .client_conn()
        .transfer(sender, b"sixth".as_slice(), b"hello".as_slice())
        .unwrap_err();
    assert_matches!(err, IllegalState::InsufficientCredit);

    pair.drive();
    let mut received = 0;
    while let Some(delivery) = pair.server_conn().poll_delivery(receiver) {
        assert_eq!(
            pair.server_conn().delivery_payload(delivery),
            Some(&b"hello"[..])
        );
        received += 1;
    }
    assert_eq!(received, 5);

    // a fresh flow lifts the limit
    pair.server_conn().flow(receiver, 1).unwrap();
    pair.drive();
    pair.client_conn()
        .transfer(sender, b"sixth".as_slice(), b"hello".as_slice())
        .unwrap();
}

#[test]
fn large_transfer_splits_across_frames() {
    let _guard = subscribe();
    let small = || {
        let mut config = TransportConfig::default();
        config.max_frame_size(512);
        config
    };
    let mut pair = Pair::new(small(), small());
    let (sender, receiver) = pair.sender_link(1);

    let payload = vec![0xab_u8; 1800];
    pair.client_conn()
        .transfer(sender, b"big".as_slice(), payload.clone())
        .unwrap();
    pair.drive();

    let delivery = pair.server_conn().poll_delivery(receiver).unwrap();
    assert_eq!(
        pair.server_conn().delivery_payload(delivery),
        Some(&payload[..])
    );
    assert_eq!(pair.server_conn().delivery_tag(delivery), Some(&b"big"[..]));
    // one delivery, despite the multiple frames
    assert!(pair.server_conn().poll_delivery(receiver).is_none());
}

#[test]
fn output_partitioning_is_equivalent() {
    let _guard = subscribe();
    let script = |t: &mut Transport| {
        t.bind(Connection::new("client"));
        let conn = t.connection_mut().unwrap();
        conn.open();
        let session = conn.begin().unwrap();
        conn.attach(session, "data", Role::Sender, None, Some(Target::default()))
            .unwrap();
    };
    let mut whole = Transport::new(TransportConfig::default());
    let mut chunked = Transport::new(TransportConfig::default());
    script(&mut whole);
    script(&mut chunked);

    let mut all_at_once = Vec::new();
    loop {
        let n = whole.pending();
        if n == 0 {
            break;
        }
        all_at_once.extend_from_slice(whole.head());
        whole.pop(n);
    }
    let mut dribbled = Vec::new();
    loop {
        let n = chunked.pending();
        if n == 0 {
            break;
        }
        let take = n.min(3);
        dribbled.extend_from_slice(&chunked.head()[..take]);
        chunked.pop(take);
    }
    assert!(!all_at_once.is_empty());
    assert_eq!(all_at_once, dribbled);
}

#[test]
fn chunked_input_is_equivalent() {
    let _guard = subscribe();
    let mut client = Transport::new(TransportConfig::default());
    client.bind(Connection::new("client"));
    {
        let conn = client.connection_mut().unwrap();
        conn.open();
        let session = conn.begin().unwrap();
        conn.attach(session, "data", Role::Sender, None, Some(Target::default()))
            .unwrap();
    }
    let mut stream = Vec::new();
    loop {
        let n = client.pending();
        if n == 0 {
            break;
        }
        stream.extend_from_slice(client.head());
        client.pop(n);
    }

    let mut whole = Transport::new(TransportConfig::default());
    whole.bind(Connection::new("server"));
    whole.input(&stream).unwrap();

    let mut chunked = Transport::new(TransportConfig::default());
    chunked.bind(Connection::new("server"));
    for byte in &stream {
        chunked.input(std::slice::from_ref(byte)).unwrap();
    }

    for t in [&whole, &chunked] {
        let conn = t.connection().unwrap();
        assert_eq!(conn.remote_state(), EndpointState::Active);
        assert_eq!(conn.sessions().count(), 1);
        let session = conn.sessions().next().unwrap();
        assert_eq!(conn.links(session).count(), 1);
        let link = conn.links(session).next().unwrap();
        assert_eq!(conn.link_role(link), Some(Role::Receiver));
        assert_eq!(conn.link_remote_state(link), Some(EndpointState::Active));
    }
}

#[test]
fn process_is_idempotent() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    pair.client.process().unwrap();
    assert_eq!(pair.client.pending(), 0);
    pair.client.process().unwrap();
    assert_eq!(pair.client.pending(), 0);
}

#[test]
fn keepalives_follow_the_remote_timeout() {
    let _guard = subscribe();
    let mut server_config = TransportConfig::default();
    server_config.idle_timeout(Some(Duration::from_secs(10)));
    let mut pair = Pair::new(TransportConfig::default(), server_config);
    pair.connect();
    // the peer advertises half its enforcement interval
    assert_eq!(
        pair.client_conn().remote_idle_timeout(),
        Some(Duration::from_secs(5))
    );

    let start = Instant::now();
    let deadline = pair.client.tick(start).unwrap();
    assert_eq!(deadline, start + Duration::from_millis(2500));
    assert_eq!(pair.client.pending(), 0);

    // silence up to the deadline produces exactly one empty frame
    pair.client.tick(deadline);
    assert_eq!(pair.client.pending(), 8);
    assert_eq!(pair.client.head(), hex!("00000008 02000000"));

    // re-ticking without time passing must not double up
    pair.client.tick(deadline);
    assert_eq!(pair.client.pending(), 8);

    pair.client.pop(8);
    let next = pair.client.tick(deadline + Duration::from_millis(1)).unwrap();
    assert!(next > deadline);
}

#[test]
fn local_idle_timeout_closes_the_connection() {
    let _guard = subscribe();
    let mut client_config = TransportConfig::default();
    client_config.idle_timeout(Some(Duration::from_secs(6)));
    let mut pair = Pair::new(client_config, TransportConfig::default());
    pair.connect();

    let start = Instant::now();
    let deadline = pair.client.tick(start).unwrap();
    assert_eq!(deadline, start + Duration::from_secs(6));

    // fresh input pushes the deadline out
    let mid = start + Duration::from_secs(3);
    pair.client
        .fill_input(&frame::encode(&Frame::keepalive(), u32::MAX).unwrap());
    pair.client.process_input().unwrap();
    let pushed = pair.client.tick(mid).unwrap();
    assert_eq!(pushed, mid + Duration::from_secs(6));
    assert_eq!(pair.client_conn().state(), EndpointState::Active);

    // a full interval of silence gives up on the peer
    pair.client.tick(pushed);
    assert_eq!(pair.client_conn().state(), EndpointState::Closed);
    assert_eq!(
        pair.client_conn().condition().unwrap().condition,
        Condition::RESOURCE_LIMIT_EXCEEDED
    );
    let frames = drain_frames(&mut pair.client);
    assert!(frames.iter().any(|f| matches!(
        &f.body,
        Body::Amqp(Some(Performative::Close(close))) if close.error.is_some()
    )));

    // closure happens once; later ticks stay quiet
    pair.client.tick(pushed + Duration::from_secs(6));
    assert_eq!(pair.client.pending(), 0);
}

#[test]
fn sasl_anonymous_handshake() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.client.sasl_client();
    pair.server.sasl_server().offer(&["ANONYMOUS", "PLAIN"]);
    pair.client_conn().open();
    pair.server_conn().open();
    pair.drive();

    assert_eq!(
        pair.client.sasl().unwrap().remote_mechanisms(),
        ["ANONYMOUS", "PLAIN"]
    );
    pair.client.sasl().unwrap().anonymous();
    pair.drive();

    assert_eq!(
        pair.server.sasl().unwrap().chosen_mechanism(),
        Some("ANONYMOUS")
    );
    pair.server.sasl().unwrap().done(SaslCode::Ok);
    pair.drive();

    assert_eq!(pair.client.sasl().unwrap().outcome(), Some(SaslCode::Ok));
    assert_eq!(pair.client_conn().remote_state(), EndpointState::Active);
    assert_eq!(pair.server_conn().remote_state(), EndpointState::Active);
}

#[test]
fn amqp_frame_during_sasl_is_fatal() {
    let _guard = subscribe();
    let mut t = Transport::new(TransportConfig::default());
    t.sasl_server().offer(&["ANONYMOUS"]);
    t.bind(Connection::new("server"));
    let mut bytes = SASL_HEADER.to_vec();
    bytes.extend_from_slice(&frame::encode(&Frame::keepalive(), u32::MAX).unwrap());
    let err = t.input(&bytes).unwrap_err();
    assert_matches!(err, TransportError::Violation(_));
    assert!(t.is_dead());
}

#[test]
fn premature_end_of_stream_is_fatal() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    let err = pair.server.input(&[]).unwrap_err();
    assert_matches!(err, TransportError::UnexpectedEos);
    assert!(pair.server.is_dead());
    assert_eq!(pair.server_conn().state(), EndpointState::Closed);
}

#[test]
fn end_of_stream_after_close_is_clean() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    pair.client_conn().close(None);
    pair.drive();
    assert_eq!(pair.server_conn().remote_state(), EndpointState::Closed);
    assert_eq!(pair.server.input(&[]).unwrap(), 0);
    assert!(!pair.server.is_dead());
}

fn open_bytes() -> Vec<u8> {
    let open = frame::encode(
        &Frame::amqp(
            0,
            Performative::Open(Open {
                container_id: "peer".into(),
                hostname: None,
                max_frame_size: u32::MAX,
                channel_max: u16::MAX,
                idle_time_out: None,
            }),
        ),
        u32::MAX,
    )
    .unwrap();
    let mut bytes = AMQP_HEADER.to_vec();
    bytes.extend_from_slice(&open);
    bytes
}

#[test]
fn frames_while_unbound_stop_frame_handling() {
    let _guard = subscribe();
    let mut t = Transport::new(TransportConfig::default());
    t.input(&open_bytes()).unwrap();
    assert!(!t.is_handling_frames());
    assert!(!t.is_dead());
}

#[test]
#[should_panic(expected = "not handling frames")]
fn handling_a_frame_after_shutdown_panics() {
    let mut t = Transport::new(TransportConfig::default());
    t.input(&open_bytes()).unwrap();
    let _ = t.handle_frame(Frame::keepalive());
}

#[test]
fn bad_protocol_header_is_fatal() {
    let _guard = subscribe();
    let mut t = Transport::new(TransportConfig::default());
    t.bind(Connection::new("server"));
    let err = t.input(b"NOTAMQP!").unwrap_err();
    assert_matches!(err, TransportError::InvalidHeader);
    assert!(t.is_dead());
}

#[test]
fn oversized_frame_kills_the_transport() {
    let _guard = subscribe();
    let mut config = TransportConfig::default();
    config.max_frame_size(512);
    let mut t = Transport::new(config);
    t.bind(Connection::new("server"));
    let mut bytes = AMQP_HEADER.to_vec();
    bytes.extend_from_slice(&1024_u32.to_be_bytes());
    bytes.extend_from_slice(&[2, 0, 0, 0]);
    let err = t.input(&bytes).unwrap_err();
    assert_matches!(err, TransportError::Malformed(_));
    assert!(!t.is_handling_frames());
    assert_eq!(t.connection().unwrap().state(), EndpointState::Closed);
}

#[test]
fn dispositions_reach_the_sender() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let (sender, receiver) = pair.sender_link(1);
    let delivery = pair
        .client_conn()
        .transfer(sender, b"tag".as_slice(), b"payload".as_slice())
        .unwrap();
    // no transfer frame has carried it yet
    assert_matches!(
        pair.client_conn()
            .disposition(delivery, DeliveryState::Accepted, false),
        Err(IllegalState::Untransferred)
    );
    pair.drive();

    let incoming = pair.server_conn().poll_delivery(receiver).unwrap();
    pair.server_conn()
        .disposition(incoming, DeliveryState::Accepted, true)
        .unwrap();
    pair.drive();

    assert_eq!(
        pair.client_conn().delivery_remote_state(delivery),
        Some(DeliveryState::Accepted)
    );
    assert!(pair.client_conn().delivery_remote_settled(delivery));

    // settling locally frees the delivery
    pair.client_conn().settle(delivery).unwrap();
    assert_matches!(
        pair.client_conn().settle(delivery),
        Err(IllegalState::UnknownDelivery)
    );
}

#[test]
fn session_teardown_frees_the_channel() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    let session = pair.client_conn().begin().unwrap();
    pair.drive();
    let mirrored = pair.server_conn().sessions().next().unwrap();
    pair.server_conn().accept(mirrored).unwrap();
    pair.drive();

    pair.client_conn().end(session, None).unwrap();
    pair.drive();
    assert_eq!(
        pair.server_conn().session_remote_state(mirrored),
        Some(EndpointState::Closed)
    );
    pair.server_conn().end(mirrored, None).unwrap();
    pair.drive();

    assert_eq!(pair.client_conn().sessions().count(), 0);
    assert_eq!(pair.server_conn().sessions().count(), 0);

    // the channel is usable again
    let again = pair.client_conn().begin().unwrap();
    pair.drive();
    assert_eq!(
        pair.client_conn().session_state(again),
        Some(EndpointState::Active)
    );
    assert_eq!(pair.server_conn().sessions().count(), 1);
}

#[test]
fn frame_after_close_is_discarded() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    pair.server_conn().close(None);
    pair.drive();
    assert_eq!(pair.client_conn().remote_state(), EndpointState::Closed);
    assert!(pair.client.is_handling_frames());

    // a straggler after the close terminates handling without a violation
    let begin = frame::encode(
        &Frame::amqp(
            0,
            Performative::Begin(Begin {
                remote_channel: None,
                next_outgoing_id: 0,
                incoming_window: 1,
                outgoing_window: 1,
                handle_max: 0,
            }),
        ),
        u32::MAX,
    )
    .unwrap();
    pair.client.input(&begin).unwrap();
    assert!(!pair.client.is_handling_frames());
    assert!(!pair.client.is_dead());
}

#[test]
fn close_carries_the_error_condition() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    pair.client_conn().close(Some(ErrorCondition::new(
        Condition::CONNECTION_FORCED,
        "maintenance",
    )));
    pair.drive();
    let condition = pair.server_conn().remote_condition().unwrap();
    assert_eq!(condition.condition, Condition::CONNECTION_FORCED);
    assert_eq!(condition.description.as_deref(), Some("maintenance"));
}

#[test]
fn detach_propagates_the_error() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let (sender, receiver) = pair.sender_link(0);
    pair.client_conn()
        .detach(
            sender,
            Some(ErrorCondition::new(Condition::DETACH_FORCED, "going away")),
        )
        .unwrap();
    pair.drive();
    assert_eq!(
        pair.server_conn().link_remote_state(receiver),
        Some(EndpointState::Closed)
    );
    let condition = pair.server_conn().link_remote_condition(receiver).unwrap();
    assert_eq!(condition.condition, Condition::DETACH_FORCED);
}

#[test]
fn transfer_without_credit_on_the_wire_is_a_violation() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    // credit 1 granted, then two wire-level transfers forged by reusing
    // the codec directly
    let (_, receiver) = pair.sender_link(1);
    let transfer = |tag: &'static [u8], id: u32| {
        Frame {
            channel: pair_channel(),
            body: Body::Amqp(Some(Performative::Transfer(frame::Transfer {
                handle: 0,
                delivery_id: Some(id),
                delivery_tag: Some(bytes::Bytes::from_static(tag)),
                message_format: Some(0),
                settled: Some(true),
                more: false,
            }))),
            payload: bytes::Bytes::from_static(b"x"),
        }
    };
    let mut bytes = frame::encode(&transfer(b"a", 0), u32::MAX).unwrap();
    bytes.extend_from_slice(&frame::encode(&transfer(b"b", 1), u32::MAX).unwrap());
    let err = pair.server.input(&bytes).unwrap_err();
    assert_matches!(err, TransportError::Violation(_));
    assert!(!pair.server.is_handling_frames());
    assert!(pair.server_conn().link_state(receiver).is_some());
    let frames = drain_frames(&mut pair.server);
    let close = frames
        .iter()
        .find_map(|f| match &f.body {
            Body::Amqp(Some(Performative::Close(close))) => Some(close.clone()),
            _ => None,
        })
        .expect("violation must produce a close frame");
    assert_eq!(
        close.error.unwrap().condition,
        Condition::TRANSFER_LIMIT_EXCEEDED
    );
}

#[test]
fn outgoing_frames_respect_the_negotiated_max_frame_size() {
    let _guard = subscribe();
    // the local declaration is the smaller of the two
    let small = {
        let mut config = TransportConfig::default();
        config.max_frame_size(512);
        config
    };
    let mut pair = Pair::new(small, TransportConfig::default());
    let (sender, receiver) = pair.sender_link(1);
    pair.client_conn()
        .transfer(sender, b"cap".as_slice(), vec![0x5a_u8; 1800])
        .unwrap();

    let mut stream = Vec::new();
    loop {
        let n = pair.client.pending();
        if n == 0 {
            break;
        }
        stream.extend_from_slice(pair.client.head());
        pair.client.pop(n);
    }
    let mut rest = &stream[..];
    let mut transfers = 0;
    while !rest.is_empty() {
        let (frame, consumed) = frame::decode(rest, u32::MAX).unwrap().unwrap();
        assert!(consumed <= 512, "emitted a {consumed}-byte frame");
        if matches!(frame.body, Body::Amqp(Some(Performative::Transfer(_)))) {
            transfers += 1;
        }
        rest = &rest[consumed..];
    }
    assert!(transfers > 1);

    pair.server.input(&stream).unwrap();
    let delivery = pair.server_conn().poll_delivery(receiver).unwrap();
    assert_eq!(
        pair.server_conn().delivery_payload(delivery).map(<[u8]>::len),
        Some(1800)
    );
}

#[test]
fn transfer_fencepost_fills_one_frame_exactly() {
    let _guard = subscribe();
    let small = || {
        let mut config = TransportConfig::default();
        config.max_frame_size(512);
        config
    };
    // overhead of the transfer performative actually emitted first on a
    // fresh link: delivery-id 0, handle 0, this tag, unsettled
    let overhead = frame::encode(
        &Frame {
            channel: pair_channel(),
            body: Body::Amqp(Some(Performative::Transfer(frame::Transfer {
                handle: 0,
                delivery_id: Some(0),
                delivery_tag: Some(bytes::Bytes::from_static(b"fence")),
                message_format: Some(0),
                settled: Some(false),
                more: false,
            }))),
            payload: bytes::Bytes::new(),
        },
        u32::MAX,
    )
    .unwrap()
    .len();
    let fit = 512 - overhead;

    // a payload of exactly `fit` bytes goes out as one full-size frame
    let mut pair = Pair::new(small(), small());
    let (sender, _) = pair.sender_link(1);
    pair.client_conn()
        .transfer(sender, b"fence".as_slice(), vec![0x11_u8; fit])
        .unwrap();
    assert_eq!(pair.client.pending(), 512);
    let (frame, consumed) = frame::decode(pair.client.head(), u32::MAX)
        .unwrap()
        .unwrap();
    assert_eq!(consumed, 512);
    assert_matches!(
        frame.body,
        Body::Amqp(Some(Performative::Transfer(frame::Transfer { more: false, .. })))
    );
    pair.client.pop(512);
    assert_eq!(pair.client.pending(), 0);

    // one byte more must split
    let mut pair = Pair::new(small(), small());
    let (sender, _) = pair.sender_link(1);
    pair.client_conn()
        .transfer(sender, b"fence".as_slice(), vec![0x11_u8; fit + 1])
        .unwrap();
    let frames = drain_frames(&mut pair.client);
    let flags: Vec<bool> = frames
        .iter()
        .filter_map(|f| match &f.body {
            Body::Amqp(Some(Performative::Transfer(t))) => Some(t.more),
            _ => None,
        })
        .collect();
    assert_eq!(flags, [true, false]);
}

#[test]
fn channel_max_bounds_session_allocation() {
    let _guard = subscribe();
    // our own declared maximum
    let mut one_channel = TransportConfig::default();
    one_channel.channel_max(0);
    let mut pair = Pair::new(one_channel, TransportConfig::default());
    pair.connect();
    pair.client_conn().begin().unwrap();
    assert_matches!(
        pair.client_conn().begin().unwrap_err(),
        IllegalState::ChannelsExhausted
    );

    // the peer's declared maximum binds the same way
    let mut restrictive = TransportConfig::default();
    restrictive.channel_max(0);
    let mut pair = Pair::new(TransportConfig::default(), restrictive);
    pair.connect();
    assert_eq!(pair.client_conn().remote_channel_max(), 0);
    pair.client_conn().begin().unwrap();
    assert_matches!(
        pair.client_conn().begin().unwrap_err(),
        IllegalState::ChannelsExhausted
    );
}

#[test]
fn output_buffer_handoff_drains_exactly_once() {
    let _guard = subscribe();
    let mut t = Transport::new(TransportConfig::default());
    assert_eq!(t.output_buffer(), AMQP_HEADER);
    t.output_consumed();
    assert!(t.output_buffer().is_empty());
    t.output_consumed();

    t.bind(Connection::new("client"));
    t.connection_mut().unwrap().open();
    let window = t.output_buffer().to_vec();
    assert!(!window.is_empty());
    t.output_consumed();
    // the open was drained, nothing is re-offered
    assert!(t.output_buffer().is_empty());
    assert_eq!(window, {
        let mut t = Transport::new(TransportConfig::default());
        t.output_buffer();
        t.output_consumed();
        t.bind(Connection::new("client"));
        t.connection_mut().unwrap().open();
        t.output_buffer().to_vec()
    });
}

#[test]
fn unbinding_releases_the_connection() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    let connection = pair.client.unbind().expect("a connection was bound");
    assert_eq!(connection.remote_state(), EndpointState::Active);
    assert!(pair.client.connection().is_none());

    // a frame arriving while unbound terminates handling, not the process
    let begin = frame::encode(
        &Frame::amqp(
            1,
            Performative::Begin(Begin {
                remote_channel: None,
                next_outgoing_id: 0,
                incoming_window: 1,
                outgoing_window: 1,
                handle_max: 0,
            }),
        ),
        u32::MAX,
    )
    .unwrap();
    pair.client.fill_input(&begin);
    pair.client.process_input().unwrap();
    assert!(!pair.client.is_handling_frames());
    assert!(!pair.client.is_dead());
}

#[test]
fn close_head_discards_pending_output() {
    let _guard = subscribe();
    let mut t = Transport::new(TransportConfig::default());
    t.bind(Connection::new("client"));
    t.connection_mut().unwrap().open();
    assert!(t.pending() > 0);

    t.close_head();
    assert_eq!(t.pending(), 0);
    // later local activity produces nothing either
    t.connection_mut().unwrap().close(None);
    assert_eq!(t.pending(), 0);
}

// channel the client's first session lands on
fn pair_channel() -> u16 {
    0
}
