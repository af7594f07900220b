// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end `Writer` scenarios against a hand-rolled `nsqd` stand-in.

mod support;

use std::time::Duration;

use nsq::{Writer, WriterConfig};

#[test]
fn publish_round_trips_through_a_real_socket() {
    let (listener, addr) = support::listener();
    let writer = Writer::new(WriterConfig::new([addr])).expect("writer construction");

    let mut server = support::accept(&listener);
    support::handshake_publisher(&mut server);

    let (pub_line, body) = support::read_line_with_body(&mut server);
    assert_eq!(pub_line, "PUB greetings");
    assert_eq!(body, b"hello world");
    support::write_frame(&mut server, support::RESPONSE, b"OK");

    let result = writer.publish("greetings", b"hello world".to_vec());
    result.expect("publish should succeed once the broker answers OK");
}

#[test]
fn publish_surfaces_a_broker_error() {
    let (listener, addr) = support::listener();
    let writer = Writer::new(WriterConfig::new([addr])).expect("writer construction");

    let mut server = support::accept(&listener);
    support::handshake_publisher(&mut server);

    let (pub_line, _body) = support::read_line_with_body(&mut server);
    assert_eq!(pub_line, "PUB bad_topic!");
    support::write_frame(&mut server, support::ERROR, b"E_BAD_TOPIC topic name is invalid");

    let err = writer.publish("bad_topic!", b"x".to_vec()).expect_err("broker error should surface");
    match err {
        nsq::Error::Broker { code, fatal, .. } => {
            assert_eq!(code, "E_BAD_TOPIC");
            assert!(fatal);
        }
        other => panic!("expected a broker error, got {other:?}"),
    }
}

#[test]
fn publish_multi_encodes_every_body() {
    let (listener, addr) = support::listener();
    let writer = Writer::new(WriterConfig::new([addr])).expect("writer construction");

    let mut server = support::accept(&listener);
    support::handshake_publisher(&mut server);

    let (mpub_line, body) = support::read_line_with_body(&mut server);
    assert_eq!(mpub_line, "MPUB batched");
    let count = u32::from_be_bytes(body[0..4].try_into().unwrap());
    assert_eq!(count, 2);
    let first_len = u32::from_be_bytes(body[4..8].try_into().unwrap()) as usize;
    let first = &body[8..8 + first_len];
    assert_eq!(first, b"one");
    support::write_frame(&mut server, support::RESPONSE, b"OK");

    writer
        .publish_multi("batched", vec![b"one".to_vec(), b"two".to_vec()])
        .expect("publish_multi should succeed");
}

#[test]
fn writer_close_stops_the_background_thread() {
    let (listener, addr) = support::listener();
    let mut writer = Writer::new(WriterConfig::new([addr])).expect("writer construction");

    let mut server = support::accept(&listener);
    support::handshake_publisher(&mut server);

    writer.close();
    // close() joins the worker thread internally; a second call is a no-op.
    writer.close();
    drop(server);
    // Give any in-flight teardown a moment before the test process exits.
    std::thread::sleep(Duration::from_millis(50));
}
