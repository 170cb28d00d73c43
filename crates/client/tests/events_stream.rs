//! Integration test: the events client registers filters, dispatches
//! change notifications, and keeps the server-side token fresh.
//!
//! Covered:
//! - `add_events_filter` sends a register message with the wire field names
//! - filters re-register automatically on reconnect
//! - CREATE/UPDATE/DELETE dispatch to the matching handler hook
//! - malformed events are ignored without killing the stream
//! - the keep-alive task pushes a refreshed token before expiry

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use gw_client::{
    AuthError, EventMessage, EventsClient, EventsFilter, EventsHandler, SessionConfig,
    TokenProvider, WsEndpoint,
};
use gw_protocol::epoch_ms;

// ── Test provider with a near-term refresh time ─────────────────────────

struct RefreshingProvider {
    addr: SocketAddr,
    refreshes: AtomicUsize,
    refresh_after_ms: Option<i64>,
}

#[async_trait::async_trait]
impl TokenProvider for RefreshingProvider {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(format!("tok-{}", self.refreshes.load(Ordering::SeqCst)))
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn refresh_time(&self) -> Option<i64> {
        self.refresh_after_ms.map(|ms| epoch_ms() + ms)
    }

    fn websocket_endpoint(&self, _api_name: &str) -> Result<WsEndpoint, AuthError> {
        Ok(WsEndpoint::new(
            format!("ws://{}/", self.addr),
            "events-1.0.0",
        ))
    }
}

// ── Test handler: records (kind, id) pairs ──────────────────────────────

struct RecordingEvents {
    seen: mpsc::Sender<(String, String)>,
}

#[async_trait::async_trait]
impl EventsHandler for RecordingEvents {
    async fn on_create(&self, event: &EventMessage) {
        let _ = self.seen.send(("CREATE".into(), event.id.clone())).await;
    }

    async fn on_update(&self, event: &EventMessage) {
        let _ = self.seen.send(("UPDATE".into(), event.id.clone())).await;
    }

    async fn on_delete(&self, event: &EventMessage) {
        let _ = self.seen.send(("DELETE".into(), event.id.clone())).await;
    }
}

// ── Mini server ─────────────────────────────────────────────────────────

struct Conn {
    send: mpsc::Sender<String>,
    recv: mpsc::Receiver<String>,
}

async fn start_server() -> (SocketAddr, mpsc::Receiver<Conn>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::channel(4);

    tokio::spawn(async move {
        while let Ok((stream, _peer)) = listener.accept().await {
            let conn_tx = conn_tx.clone();
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_hdr_async(
                    stream,
                    |req: &Request, mut resp: Response| {
                        // Accept the first offered sub-protocol; the client
                        // rejects a handshake that selects none.
                        let offered = req
                            .headers()
                            .get("sec-websocket-protocol")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default();
                        if let Some(first) =
                            offered.split(',').map(str::trim).find(|p| !p.is_empty())
                        {
                            resp.headers_mut().insert(
                                "sec-websocket-protocol",
                                HeaderValue::from_str(first).unwrap(),
                            );
                        }
                        Ok(resp)
                    },
                )
                .await
                .unwrap();
                let (mut sink, mut stream) = ws.split();

                let (msg_tx, mut msg_rx) = mpsc::channel::<String>(16);
                let (text_tx, text_rx) = mpsc::channel::<String>(16);
                let _ = conn_tx
                    .send(Conn {
                        send: msg_tx,
                        recv: text_rx,
                    })
                    .await;

                loop {
                    tokio::select! {
                        out = msg_rx.recv() => match out {
                            Some(text) => {
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        },
                        inbound = stream.next() => match inbound {
                            Some(Ok(Message::Text(text))) => {
                                let _ = text_tx.send(text).await;
                            }
                            Some(Ok(_)) => {}
                            _ => break,
                        },
                    }
                }
            });
        }
    });

    (addr, conn_rx)
}

impl Conn {
    async fn recv_json(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(5), self.recv.recv())
            .await
            .expect("timeout waiting for client message")
            .expect("connection dropped");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }
}

async fn next_conn(conn_rx: &mut mpsc::Receiver<Conn>) -> Conn {
    tokio::time::timeout(Duration::from_secs(5), conn_rx.recv())
        .await
        .expect("timeout waiting for connection")
        .expect("server stopped")
}

fn event(id: &str, event_type: &str) -> String {
    serde_json::json!({
        "id": id,
        "type": event_type,
        "timestamp": epoch_ms(),
        "body": {"ogit/_id": id},
        "metadata": {},
    })
    .to_string()
}

fn start_pieces(
    addr: SocketAddr,
    refresh_after_ms: Option<i64>,
) -> (Arc<RefreshingProvider>, EventsClient, mpsc::Receiver<(String, String)>) {
    let provider = Arc::new(RefreshingProvider {
        addr,
        refreshes: AtomicUsize::new(0),
        refresh_after_ms,
    });
    let (seen_tx, seen_rx) = mpsc::channel(16);
    let client = EventsClient::new(
        provider.clone(),
        SessionConfig::new("events-ws"),
        Arc::new(RecordingEvents { seen: seen_tx }),
    )
    .unwrap();
    (provider, client, seen_rx)
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn filters_register_and_survive_reconnect() {
    let (addr, mut conn_rx) = start_server().await;
    let (_provider, client, _seen) = start_pieces(addr, None);
    client.start().await.unwrap();
    let mut conn = next_conn(&mut conn_rx).await;

    client
        .add_events_filter(EventsFilter::new("f1", "(element.ogit/_type=ogit/Alert)"))
        .await
        .unwrap();

    let register = conn.recv_json().await;
    assert_eq!(register["type"], "register");
    assert_eq!(register["args"]["filter-id"], "f1");
    assert_eq!(register["args"]["filter-type"], "jfilter");
    assert_eq!(
        register["args"]["filter-content"],
        "(element.ogit/_type=ogit/Alert)"
    );
    assert_eq!(client.filter_count(), 1);

    // Drop the connection: the reconnect re-registers the filter without
    // any action from the caller.
    drop(conn);
    let mut conn2 = next_conn(&mut conn_rx).await;
    let register = conn2.recv_json().await;
    assert_eq!(register["type"], "register");
    assert_eq!(register["args"]["filter-id"], "f1");

    client.stop().await.unwrap();
}

#[tokio::test]
async fn events_dispatch_by_type() {
    let (addr, mut conn_rx) = start_server().await;
    let (_provider, client, mut seen) = start_pieces(addr, None);
    client.start().await.unwrap();
    let conn = next_conn(&mut conn_rx).await;

    conn.send.send(event("e1", "CREATE")).await.unwrap();
    conn.send.send(event("e2", "update")).await.unwrap(); // lowercase on the wire
    conn.send.send(event("e3", "DELETE")).await.unwrap();

    let mut got = Vec::new();
    for _ in 0..3 {
        let pair = tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .expect("timeout waiting for event")
            .expect("handler dropped");
        got.push(pair);
    }
    assert_eq!(
        got,
        vec![
            ("CREATE".to_owned(), "e1".to_owned()),
            ("UPDATE".to_owned(), "e2".to_owned()),
            ("DELETE".to_owned(), "e3".to_owned()),
        ]
    );

    client.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_events_do_not_kill_the_stream() {
    let (addr, mut conn_rx) = start_server().await;
    let (_provider, client, mut seen) = start_pieces(addr, None);
    client.start().await.unwrap();
    let conn = next_conn(&mut conn_rx).await;

    conn.send.send("{not json at all".into()).await.unwrap();
    conn.send
        .send(r#"{"id":"x","type":"CREATE"}"#.into()) // missing required fields
        .await
        .unwrap();
    conn.send.send(event("e9", "CREATE")).await.unwrap();

    let pair = tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .expect("timeout waiting for event")
        .expect("handler dropped");
    assert_eq!(pair, ("CREATE".to_owned(), "e9".to_owned()));

    client.stop().await.unwrap();
}

#[tokio::test]
async fn keep_alive_pushes_a_refreshed_token() {
    let (addr, mut conn_rx) = start_server().await;
    // Refresh due shortly after connect (floored at 1s by the client).
    let (provider, client, _seen) = start_pieces(addr, Some(1_100));
    client.start().await.unwrap();
    let mut conn = next_conn(&mut conn_rx).await;

    let token_msg = conn.recv_json().await;
    assert_eq!(token_msg["type"], "token");
    assert_eq!(token_msg["args"]["_TOKEN"], "tok-1");
    assert!(provider.refreshes.load(Ordering::SeqCst) >= 1);

    client.stop().await.unwrap();
}
