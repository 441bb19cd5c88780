//! End-to-end lifecycle tests: the connection manager, a real
//! listener, and a mock extension peer speaking the wire protocol.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use supersurf::config::Config;
use supersurf::manager::{ConnectionManager, ConnectionState};

type PeerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_manager() -> Arc<ConnectionManager> {
    let config = Config {
        port: 0,
        ..Config::default()
    };
    ConnectionManager::new(config)
}

async fn connect_and_handshake(port: u16) -> PeerStream {
    let url = format!("ws://127.0.0.1:{port}/extension");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let handshake = json!({
        "type": "handshake",
        "browser": "Chrome",
        "version": "2.1.0",
        "buildTimestamp": "2026-07-30T08:15:00Z",
    });
    ws.send(Message::Text(handshake.to_string().into()))
        .await
        .unwrap();
    ws
}

async fn wait_for_state(manager: &Arc<ConnectionManager>, want: ConnectionState) {
    for _ in 0..100 {
        if manager.state() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("manager never reached {want:?}, still {:?}", manager.state());
}

#[tokio::test]
async fn full_lifecycle_enable_handshake_disable() {
    let manager = test_manager();
    assert_eq!(manager.state(), ConnectionState::Passive);

    // Enable with a client id binds the listener.
    let reply = manager.enable(Some("proj")).await.unwrap();
    assert_eq!(reply.data["status"], "enabled");
    assert_eq!(manager.state(), ConnectionState::Active);
    let port = manager.transport().unwrap().port();

    // The peer connects and announces itself.
    let mut peer = connect_and_handshake(port).await;

    // The broker pushes the client id as an `authenticated`
    // notification.
    let note = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match peer.next().await.unwrap().unwrap() {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["method"] == "authenticated" {
                        return value;
                    }
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(note["params"]["clientId"], "proj");

    wait_for_state(&manager, ConnectionState::Connected).await;
    let header = manager.status_header();
    assert!(header.starts_with("✅ v"), "header: {header}");
    assert!(header.contains("| Chrome"));

    // Disable tears everything down.
    let reply = manager.disable().await.unwrap();
    assert_eq!(reply.data["status"], "disabled");
    assert_eq!(manager.state(), ConnectionState::Passive);
    assert!(manager.transport().is_none());

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match peer.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(closed, "peer socket should close on disable");
}

#[tokio::test]
async fn peer_disconnect_returns_to_active_and_clears_tab() {
    let manager = test_manager();
    manager.enable(Some("proj")).await.unwrap();
    let port = manager.transport().unwrap().port();

    let mut peer = connect_and_handshake(port).await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    // Push a tab record, confirm the manager sees it.
    let note = json!({
        "jsonrpc": "2.0",
        "method": "notifications/tab_info_update",
        "params": {"tab": {"tabId": 5, "index": 0, "title": "T", "url": "https://example.com"}},
    });
    peer.send(Message::Text(note.to_string().into()))
        .await
        .unwrap();
    for _ in 0..100 {
        if manager.attached_tab().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(manager.attached_tab().unwrap().tab_id, 5);

    // Peer loss: back to active, tab cleared, still listening.
    drop(peer);
    wait_for_state(&manager, ConnectionState::Active).await;
    assert!(manager.attached_tab().is_none());

    // A replacement peer can connect and re-handshake.
    let _peer = connect_and_handshake(port).await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    manager.disable().await.unwrap();
}

#[tokio::test]
async fn status_header_truncates_long_urls() {
    let manager = test_manager();
    manager.enable(Some("proj")).await.unwrap();
    let port = manager.transport().unwrap().port();

    let mut peer = connect_and_handshake(port).await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    let long_url = format!("https://example.com/{}", "deep/".repeat(20));
    let note = json!({
        "jsonrpc": "2.0",
        "method": "notifications/tab_info_update",
        "params": {"tab": {
            "tabId": 2,
            "index": 3,
            "title": "Deep",
            "url": long_url,
            "techStack": ["React", "Tailwind"],
        }},
    });
    peer.send(Message::Text(note.to_string().into()))
        .await
        .unwrap();
    for _ in 0..100 {
        if manager.attached_tab().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let header = manager.status_header();
    assert!(header.contains("📄 Tab 3: "));
    assert!(header.contains("..."), "long URL should be truncated");
    assert!(!header.contains("deep/deep/deep/deep/deep/deep/deep/"));
    assert!(header.contains("🔧 React + Tailwind"));

    manager.disable().await.unwrap();
}

#[tokio::test]
async fn tool_call_round_trip_through_mock_peer() {
    let manager = test_manager();
    manager.enable(Some("proj")).await.unwrap();
    let port = manager.transport().unwrap().port();

    let mut peer = connect_and_handshake(port).await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    // Serve exactly one tabs command from the mock peer.
    let peer_task = tokio::spawn(async move {
        loop {
            match peer.next().await.unwrap().unwrap() {
                Message::Text(text) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    if frame["method"] == "tabs" {
                        assert_eq!(frame["params"]["action"], "list");
                        let response = json!({
                            "jsonrpc": "2.0",
                            "id": frame["id"],
                            "result": {"tabs": [
                                {"tabId": 1, "index": 0, "title": "Home", "url": "https://example.com"},
                            ]},
                        });
                        peer.send(Message::Text(response.to_string().into()))
                            .await
                            .unwrap();
                        return peer;
                    }
                }
                _ => {}
            }
        }
    });

    let result = manager
        .call_tool("browser_tabs", &json!({"action": "list"}), true)
        .await;
    assert_eq!(result["success"], true);
    assert_eq!(result["tabs"][0]["tabId"], 1);

    let _peer = peer_task.await.unwrap();
    manager.disable().await.unwrap();
}

#[tokio::test]
async fn browser_tool_fails_cleanly_without_peer() {
    let manager = test_manager();
    manager.enable(Some("proj")).await.unwrap();
    // Listener up, but no extension yet.
    let result = manager
        .call_tool("browser_snapshot", &json!({}), true)
        .await;
    assert_eq!(result["success"], false);
    assert_eq!(result["error"], "disconnected");
    manager.disable().await.unwrap();
}
