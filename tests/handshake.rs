mod common;

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;

use common::*;
use editor_bridge::handshake::MAX_HANDSHAKE_BYTES;
use editor_bridge::{ConnectionState, MemoryStore};

fn rejected_status(err: WsError) -> u16 {
    match err {
        WsError::Http(resp) => resp.status().as_u16(),
        other => panic!("expected an http rejection, got {other:?}"),
    }
}

async fn raw_exchange(addr: SocketAddr, request: Vec<u8>) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("tcp connect");
    stream.write_all(&request).await.expect("write request");
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn missing_or_wrong_token_is_401() {
    let dir = tempfile::tempdir().unwrap();
    let mut bridge = build_bridge(dir.path(), std::sync::Arc::new(MemoryStore::new()));
    bridge.connect();
    let addr = bridge.local_addr().unwrap();

    let err = drive(&mut bridge, connect_client(addr, None))
        .await
        .expect_err("no token must be refused");
    assert_eq!(rejected_status(err), 401);

    let err = drive(&mut bridge, connect_client(addr, Some("not-the-token")))
        .await
        .expect_err("wrong token must be refused");
    assert_eq!(rejected_status(err), 401);

    pump_for(&mut bridge, std::time::Duration::from_millis(50)).await;
    assert_eq!(bridge.state(), ConnectionState::Connecting);
}

#[tokio::test]
async fn wrong_mount_path_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let mut bridge = build_bridge(dir.path(), std::sync::Arc::new(MemoryStore::new()));
    bridge.connect();
    let addr = bridge.local_addr().unwrap();

    let mut request = format!("ws://{addr}/elsewhere").into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {TOKEN}")).unwrap(),
    );
    let err = drive(&mut bridge, tokio_tungstenite::connect_async(request))
        .await
        .expect_err("unknown path must be refused");
    assert_eq!(rejected_status(err), 404);
}

#[tokio::test]
async fn query_and_legacy_header_tokens_are_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let mut bridge = build_bridge(dir.path(), std::sync::Arc::new(MemoryStore::new()));
    bridge.connect();
    let addr = bridge.local_addr().unwrap();

    let request = format!("ws://{addr}/bridge/?token={TOKEN}")
        .into_client_request()
        .unwrap();
    let (mut first, _) = drive(&mut bridge, tokio_tungstenite::connect_async(request))
        .await
        .expect("query token accepted");
    let hello = drive(&mut bridge, recv_json(&mut first)).await;
    assert_eq!(hello["type"], "hello");

    let mut request = format!("ws://{addr}/bridge").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("X-Bridge-Token", HeaderValue::from_static(TOKEN));
    let (mut second, _) = drive(&mut bridge, tokio_tungstenite::connect_async(request))
        .await
        .expect("legacy header accepted");
    let hello = drive(&mut bridge, recv_json(&mut second)).await;
    assert_eq!(hello["type"], "hello");
}

#[tokio::test]
async fn plain_http_request_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let mut bridge = build_bridge(dir.path(), std::sync::Arc::new(MemoryStore::new()));
    bridge.connect();
    let addr = bridge.local_addr().unwrap();

    let request = format!(
        "POST /bridge HTTP/1.1\r\nHost: {addr}\r\nAuthorization: Bearer {TOKEN}\r\n\r\n"
    );
    let response = drive(&mut bridge, raw_exchange(addr, request.into_bytes())).await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
}

#[tokio::test]
async fn oversized_handshake_is_431() {
    let dir = tempfile::tempdir().unwrap();
    let mut bridge = build_bridge(dir.path(), std::sync::Arc::new(MemoryStore::new()));
    bridge.connect();
    let addr = bridge.local_addr().unwrap();

    // Exactly the limit with no terminator, so the server consumes every byte.
    let mut request = b"GET /bridge HTTP/1.1\r\nX-Padding: ".to_vec();
    request.resize(MAX_HANDSHAKE_BYTES, b'a');
    let response = drive(&mut bridge, raw_exchange(addr, request)).await;
    assert!(response.starts_with("HTTP/1.1 431"), "{response}");
}
