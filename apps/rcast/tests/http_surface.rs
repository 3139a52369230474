// SPDX-FileCopyrightText: © 2025 RelayCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! HTTP surface tests driving the router in-process: publish/subscribe
//! round-trips, name conflicts, offline and malformed-publisher handling.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower::util::ServiceExt;

use relaycast_server::config::Config;
use relaycast_server::server::create_app;

// Matroska element IDs used by the fixtures.
const EBML: u32 = 0x1A45_DFA3;
const SEGMENT: u32 = 0x1853_8067;
const INFO: u32 = 0x1549_A966;
const TRACKS: u32 = 0x1654_AE6B;
const CLUSTER: u32 = 0x1F43_B675;
const TIMECODE: u32 = 0xE7;
const SIMPLE_BLOCK: u32 = 0xA3;

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

fn header_fixture() -> Vec<u8> {
    let mut out = element(EBML, &[0x42, 0x86, 0x81, 0x01]);
    out.extend_from_slice(&id_bytes(SEGMENT));
    out.push(0xFF); // unknown-length segment
    out.extend_from_slice(&element(INFO, &[0xAA; 6]));
    out.extend_from_slice(&element(TRACKS, &[0xBB; 9]));
    out
}

/// Known-length cluster: one timecode, one simple block.
fn cluster_fixture(timecode: u64, block: &[u8]) -> Vec<u8> {
    let mut body =
        element(TIMECODE, &[(timecode >> 8) as u8, (timecode & 0xFF) as u8]);
    body.extend_from_slice(&element(SIMPLE_BLOCK, block));
    element(CLUSTER, &body)
}

fn app() -> axum::Router {
    create_app(Config::default()).0
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request builds")
}

fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder().method("POST").uri(uri).body(body.into()).expect("request builds")
}

#[tokio::test]
async fn test_offline_stream_is_404() {
    let app = app();
    let response = app.oneshot(get("/stream/x")).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = to_bytes(response.into_body(), 1024).await.expect("body reads");
    assert_eq!(&body[..], b"this stream is offline");
}

#[tokio::test]
async fn test_offline_watch_page_is_404() {
    let app = app();
    let response = app.oneshot(get("/x")).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_other_methods_are_405() {
    let app = app();
    let request = Request::builder()
        .method("DELETE")
        .uri("/stream/x")
        .body(Body::empty())
        .expect("request builds");
    let response = app.oneshot(request).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = app();
    let response = app.oneshot(get("/healthz")).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), 4096).await.expect("body reads");
    let json: serde_json::Value = serde_json::from_slice(&body).expect("health is JSON");
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_publish_then_watch_headers() {
    let app = app();
    let mut fixture = header_fixture();
    fixture.extend_from_slice(&cluster_fixture(100, &[1, 2]));

    let response =
        app.clone().oneshot(post("/stream/live", fixture)).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Inside the grace window the stream is still subscribable.
    let response = app.clone().oneshot(get("/stream/live")).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/webm");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    // And the watch page embeds it.
    let response = app.oneshot(get("/live")).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), 65536).await.expect("body reads");
    assert!(String::from_utf8_lossy(&body).contains("/stream/live"));
}

#[tokio::test]
async fn test_zero_length_publish_is_204() {
    let app = app();
    let response = app.oneshot(post("/stream/empty", Body::empty())).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_junk_publisher_is_400_and_leaves_nothing() {
    let app = app();
    let response = app
        .clone()
        .oneshot(post("/stream/x", Bytes::from_static(&[0x00])))
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The failed session must not be visible to subscribers.
    let response = app.oneshot(get("/stream/x")).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_second_publisher_is_403() {
    let app = app();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(8);
    let body = Body::from_stream(ReceiverStream::new(rx));

    let first = tokio::spawn(app.clone().oneshot(post("/stream/x", body)));
    tx.send(Ok(Bytes::from(header_fixture()))).await.expect("publisher accepts");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let response = app
        .clone()
        .oneshot(post("/stream/x", Bytes::from(header_fixture())))
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = to_bytes(response.into_body(), 1024).await.expect("body reads");
    assert_eq!(&body[..], b"stream id already taken");

    // The original publisher is unaffected and finishes cleanly.
    drop(tx);
    let response = first.await.expect("publisher task").expect("router responds");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_live_subscriber_receives_rebased_stream() {
    let app = app();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(8);
    let publisher_body = Body::from_stream(ReceiverStream::new(rx));
    let publisher = tokio::spawn(app.clone().oneshot(post("/stream/live", publisher_body)));

    // Header plus a first (closed) cluster before the subscriber arrives.
    let mut opening = header_fixture();
    opening.extend_from_slice(&cluster_fixture(1000, &[1, 1]));
    tx.send(Ok(Bytes::from(opening))).await.expect("publisher accepts");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let response = app.clone().oneshot(get("/stream/live")).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body().into_data_stream();

    let primer = body.next().await.expect("primed").expect("stream is healthy");
    assert_eq!(&primer[..], &header_fixture()[..]);

    // The next cluster reaches the subscriber rebased to timecode zero.
    tx.send(Ok(Bytes::from(cluster_fixture(2000, &[2, 2])))).await.expect("publisher accepts");
    let delivered = body.next().await.expect("cluster 2").expect("stream is healthy");
    assert_eq!(&delivered[..], &cluster_fixture(0, &[2, 2])[..]);

    // And the one after keeps the original spacing.
    tx.send(Ok(Bytes::from(cluster_fixture(2400, &[3, 3])))).await.expect("publisher accepts");
    let delivered = body.next().await.expect("cluster 3").expect("stream is healthy");
    assert_eq!(&delivered[..], &cluster_fixture(400, &[3, 3])[..]);

    drop(tx);
    let response = publisher.await.expect("publisher task").expect("router responds");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
