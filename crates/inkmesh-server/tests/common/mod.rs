#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use inkmesh_server::{AppState, ServerConfig};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Start a server on an ephemeral port.
pub async fn spawn_server(config: ServerConfig) -> (SocketAddr, Arc<AppState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(AppState::new(&config));
    tokio::spawn(inkmesh_server::serve(listener, Arc::clone(&state)));
    (addr, state)
}

pub async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (socket, _) = connect_async(format!("ws://{}{}", addr, path)).await.unwrap();
    socket
}

pub async fn send_json<T: Serialize>(client: &mut Client, msg: &T) {
    let json = serde_json::to_string(msg).unwrap();
    client.send(Message::text(json)).await.unwrap();
}

/// Next text frame, parsed.
pub async fn recv_json<T: DeserializeOwned>(client: &mut Client) -> T {
    loop {
        let frame = tokio::time::timeout(TIMEOUT, client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Poll `check` until it holds or the timeout elapses.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
