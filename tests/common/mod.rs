#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use editor_bridge::{
    Bridge, BridgeConfig, Collaborators, CommandExecutor, ContextProvider, Credentials,
    DurableStore, FileStore, HostInfo,
};

pub const TOKEN: &str = "test-token-1234567890";
const DRIVE_LIMIT: Duration = Duration::from_secs(10);

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `echo` returns its payload, `fail` errors, `panic` panics and
/// `recompile` is reload-triggering.
pub struct RecordingExecutor;

impl CommandExecutor for RecordingExecutor {
    fn execute(&self, tool_name: &str, payload: &Map<String, Value>) -> anyhow::Result<Value> {
        match tool_name {
            "echo" => Ok(Value::Object(payload.clone())),
            "fail" => anyhow::bail!("boom"),
            "panic" => panic!("executor exploded"),
            "recompile" => Ok(json!({ "queued": true })),
            other => anyhow::bail!("unknown tool {other}"),
        }
    }

    fn is_reload_triggering(&self, tool_name: &str, _payload: &Map<String, Value>) -> bool {
        tool_name == "recompile"
    }
}

pub struct StaticContext;

impl ContextProvider for StaticContext {
    fn snapshot(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("scene".into(), json!("Main"));
        map
    }
}

pub fn test_config(state_dir: &Path) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.port = 0;
    config.state_dir = state_dir.to_path_buf();
    config.token_file = None;
    config.host_info = HostInfo {
        name: "TestEditor".into(),
        version: "2024.1".into(),
    };
    config
}

pub fn file_store(dir: &Path) -> Arc<dyn DurableStore> {
    Arc::new(FileStore::new(dir))
}

pub fn build_bridge(state_dir: &Path, store: Arc<dyn DurableStore>) -> Bridge {
    Bridge::new(
        test_config(state_dir),
        Credentials::from_token(TOKEN),
        Collaborators {
            executor: Arc::new(RecordingExecutor),
            context: Arc::new(StaticContext),
            store,
        },
    )
}

/// Ticks the bridge every few milliseconds until `fut` completes.
pub async fn drive<F: Future>(bridge: &mut Bridge, fut: F) -> F::Output {
    let pumped = async {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = tokio::time::sleep(Duration::from_millis(5)) => bridge.tick().await,
            }
        }
    };
    tokio::time::timeout(DRIVE_LIMIT, pumped)
        .await
        .expect("bridge test timed out")
}

pub async fn wait_until<P>(bridge: &mut Bridge, mut done: P)
where
    P: FnMut(&Bridge) -> bool,
{
    let waited = async {
        while !done(&*bridge) {
            bridge.tick().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(DRIVE_LIMIT, waited)
        .await
        .expect("condition never became true");
}

/// Ticks for a fixed wall-clock duration.
pub async fn pump_for(bridge: &mut Bridge, duration: Duration) {
    let _ = tokio::time::timeout(duration, async {
        loop {
            bridge.tick().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

pub async fn connect_client(addr: SocketAddr, token: Option<&str>) -> Result<Client, WsError> {
    let mut request = format!("ws://{addr}/bridge").into_client_request()?;
    if let Some(token) = token {
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header value"),
        );
    }
    let (ws, _resp) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

/// Connects with the test token and consumes `hello`.
pub async fn connect_and_greet(bridge: &mut Bridge) -> (Client, Value) {
    let addr = bridge.local_addr().expect("bridge is listening");
    let mut client = drive(bridge, connect_client(addr, Some(TOKEN)))
        .await
        .expect("client connects");
    let hello = drive(bridge, recv_json(&mut client)).await;
    assert_eq!(hello["type"], "hello");
    (client, hello)
}

pub async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("client send");
}

pub async fn recv_json(client: &mut Client) -> Value {
    loop {
        match client.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).expect("bridge sent json");
            }
            Some(Ok(Message::Close(frame))) => panic!("connection closed: {frame:?}"),
            Some(Ok(_)) => continue,
            other => panic!("connection ended: {other:?}"),
        }
    }
}

/// Skips envelopes until one of `kind` arrives.
pub async fn recv_type(client: &mut Client, kind: &str) -> Value {
    loop {
        let value = recv_json(client).await;
        if value["type"] == kind {
            return value;
        }
    }
}

/// Everything received within `window`, stopping early at close.
pub async fn collect_for(bridge: &mut Bridge, client: &mut Client, window: Duration) -> Vec<Value> {
    let mut out = Vec::new();
    let collect = async {
        while let Some(Ok(msg)) = client.next().await {
            match msg {
                Message::Text(text) => {
                    out.push(serde_json::from_str(text.as_str()).expect("bridge sent json"))
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    };
    let _ = drive(bridge, tokio::time::timeout(window, collect)).await;
    out
}

/// Reads until the bridge closes the socket; returns its close frame if one arrived.
pub async fn expect_close(client: &mut Client) -> Option<CloseFrame> {
    loop {
        match client.next().await {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

pub fn types(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .map(|v| v["type"].as_str().unwrap_or_default().to_string())
        .collect()
}
