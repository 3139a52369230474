// SPDX-FileCopyrightText: © 2025 RelayCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end relay scenarios through the registry: publish, join
//! mid-broadcast, reconnect inside the grace window.

use std::time::Duration;

use relaycast_core::ebml::id;
use relaycast_core::{Registry, RegistryConfig, StreamEvent, StreamParser};

fn vint(value: u64) -> Vec<u8> {
    let mut width = 1;
    while width < 8 && value >= (1u64 << (7 * width)) - 1 {
        width += 1;
    }
    let mut out = vec![0u8; width];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = (value >> (8 * (width - 1 - i))) as u8;
    }
    out[0] |= 0x80 >> (width - 1);
    out
}

fn id_bytes(element: u32) -> Vec<u8> {
    let width = 4 - element.leading_zeros() as usize / 8;
    (0..width).map(|i| (element >> (8 * (width - 1 - i))) as u8).collect()
}

fn element(element: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = id_bytes(element);
    out.extend_from_slice(&vint(payload.len() as u64));
    out.extend_from_slice(payload);
    out
}

fn unbounded(element: u32) -> Vec<u8> {
    let mut out = id_bytes(element);
    out.push(0xFF);
    out
}

fn uint_payload(value: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (value >> (8 * (len - 1 - i))) as u8).collect()
}

fn header() -> Vec<u8> {
    let mut out = element(id::EBML, &[0x42, 0x86, 0x81, 0x01]);
    out.extend_from_slice(&unbounded(id::SEGMENT));
    out.extend_from_slice(&element(id::INFO, &[0xAA; 6]));
    out.extend_from_slice(&element(id::TRACKS, &[0xBB; 9]));
    out
}

/// Known-length cluster: one timecode, one simple block.
fn cluster(timecode: u64, block: &[u8]) -> Vec<u8> {
    let mut body = element(id::TIMECODE, &uint_payload(timecode, 2));
    body.extend_from_slice(&element(id::SIMPLE_BLOCK, block));
    element(id::CLUSTER, &body)
}

fn registry() -> Registry {
    Registry::new(RegistryConfig::default())
}

/// A subscriber joining before cluster 2 of a three-cluster broadcast sees
/// the header, then cluster 2 at timecode zero, then cluster 3 offset by the
/// original spacing.
#[tokio::test]
async fn test_mid_broadcast_join_rebases_timestamps() {
    let registry = registry();
    let publication = registry.publish("x").expect("fresh name");

    let mut so_far = header();
    so_far.extend_from_slice(&cluster(1000, &[1, 1]));
    publication.send(&so_far).expect("valid stream");

    let mut sub = registry.subscribe("x", false).expect("stream is live");
    let primer = sub.recv().await.expect("primed with the header");
    assert_eq!(&primer[..], &header()[..]);

    publication.send(&cluster(2000, &[2, 2])).expect("valid stream");
    let second = sub.recv().await.expect("cluster 2");
    assert_eq!(&second[..], &cluster(0, &[2, 2])[..]);

    publication.send(&cluster(2700, &[3, 3])).expect("valid stream");
    let third = sub.recv().await.expect("cluster 3");
    assert_eq!(&third[..], &cluster(700, &[3, 3])[..]);
}

/// Two subscribers attached between the same pair of publisher chunks
/// observe identical byte streams.
#[tokio::test]
async fn test_same_moment_subscribers_match() {
    let registry = registry();
    let publication = registry.publish("x").expect("fresh name");

    let mut so_far = header();
    so_far.extend_from_slice(&cluster(500, &[1]));
    publication.send(&so_far).expect("valid stream");

    let mut first = registry.subscribe("x", false).expect("stream is live");
    let mut second = registry.subscribe("x", false).expect("stream is live");

    let mut received_first = Vec::new();
    let mut received_second = Vec::new();
    received_first.extend_from_slice(&first.recv().await.expect("primer"));
    received_second.extend_from_slice(&second.recv().await.expect("primer"));

    for chunk in [cluster(900, &[2]), cluster(1300, &[3])] {
        publication.send(&chunk).expect("valid stream");
        received_first.extend_from_slice(&first.recv().await.expect("delivery"));
        received_second.extend_from_slice(&second.recv().await.expect("delivery"));
    }

    assert_eq!(received_first, received_second);
    assert!(received_first.starts_with(&header()));
    // Both joined at a boundary, so their first cluster reads timecode zero.
    let after_header = &received_first[header().len()..];
    assert!(after_header.starts_with(&cluster(0, &[2])));
}

/// Re-feeding a captured header through a fresh parser yields exactly that
/// header again: one EBML element, one Segment start, one Tracks.
#[tokio::test]
async fn test_captured_header_round_trips() {
    let registry = registry();
    let publication = registry.publish("x").expect("fresh name");
    let mut input = header();
    input.extend_from_slice(&cluster(100, &[1]));
    publication.send(&input).expect("valid stream");

    let captured = publication.broadcast().header().expect("header is frozen");
    assert_eq!(&captured[..], &header()[..]);

    let mut reference = StreamParser::new(1 << 20);
    let events = reference.feed(&captured).expect("captured header re-parses");
    let mut replayed = Vec::new();
    let mut completes = 0;
    for event in &events {
        match event {
            StreamEvent::Header(bytes) => replayed.extend_from_slice(bytes),
            StreamEvent::HeaderComplete => completes += 1,
            other => panic!("unexpected event in header replay: {other:?}"),
        }
    }
    assert_eq!(completes, 1);
    assert_eq!(replayed, header().to_vec());
}

/// A publisher reconnect inside the grace window resumes the session: the
/// attached subscriber sees the second publisher's clusters appended, with
/// the replayed initialization segment swallowed.
#[tokio::test(start_paused = true)]
async fn test_reconnect_appends_to_attached_subscriber() {
    let registry = registry();
    let first = registry.publish("x").expect("fresh name");
    let mut sub = registry.subscribe("x", false).expect("stream is live");

    let mut opening = header();
    opening.extend_from_slice(&cluster(100, &[1]));
    first.send(&opening).expect("valid stream");
    assert_eq!(&sub.recv().await.expect("opening")[..], &opening[..]);
    drop(first);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let second = registry.publish("x").expect("inside the grace window");

    let mut replayed = header();
    replayed.extend_from_slice(&cluster(40, &[9, 9]));
    second.send(&replayed).expect("replayed header tolerated");

    // Only the fresh cluster reaches the subscriber.
    let appended = sub.recv().await.expect("second publisher's data");
    assert_eq!(&appended[..], &cluster(40, &[9, 9])[..]);
    drop(second);
}

/// After the reap window passes, a held subscription observes end-of-stream
/// and the name starts a new session.
#[tokio::test(start_paused = true)]
async fn test_reap_ends_held_subscription() {
    let registry = registry();
    let publication = registry.publish("x").expect("fresh name");
    let mut sub = registry.subscribe("x", false).expect("stream is live");
    publication.send(&header()).expect("valid stream");
    drop(publication);

    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(&sub.recv().await.expect("already queued")[..], &header()[..]);
    assert!(sub.recv().await.is_none());
    assert!(!registry.contains("x"));
}
