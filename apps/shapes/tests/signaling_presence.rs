use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use serde_json::json;
use shapes_client_core::protocol::GEOMETRY_BROADCAST_TYPE;
use shapes_client_core::transport::signaling::{SignalingClient, SignalingEvent};
use shapes_client_core::{Config, PeerId, PresenceConfig, PresenceTracker};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

async fn spawn_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = shapes_relay::AppState::new(&shapes_relay::Config::default());
    tokio::spawn(shapes_relay::serve(listener, state));
    addr
}

fn config_for(addr: SocketAddr) -> Config {
    Config {
        signaling_url: format!("ws://{addr}"),
        mesh_url: format!("http://{addr}"),
        stun_url: None,
        ws_ping_interval: Duration::from_millis(100),
        ..Config::default()
    }
}

async fn join(config: &Config, room: &str, id: &str) -> Arc<SignalingClient> {
    let presence = Arc::new(PresenceTracker::new(PresenceConfig::default()));
    SignalingClient::connect_as(config, room, PeerId::from(id), presence)
        .await
        .unwrap()
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[tokio::test]
async fn peers_discover_each_other_and_measure_rtt() {
    let addr = spawn_relay().await;
    let config = config_for(addr);
    let a = join(&config, "presence", "aaaa").await;
    // Give the first socket time to join the room before the second announces.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let b = join(&config, "presence", "bbbb").await;

    let a_id = PeerId::from("aaaa");
    let b_id = PeerId::from("bbbb");
    assert!(wait_until(|| a.presence().get(&b_id).is_some() && b.presence().get(&a_id).is_some()).await);

    assert!(
        wait_until(|| {
            a.presence()
                .get(&b_id)
                .and_then(|entry| entry.ws_rtt_ms)
                .is_some()
        })
        .await,
        "ws-ping round trip never completed"
    );
    let entry = a.presence().get(&b_id).unwrap();
    assert!(entry.channel_rtt_ms.is_none());
    assert!(a.presence().get(&a_id).is_none(), "self echo must not register");
}

#[tokio::test]
async fn rooms_are_isolated() {
    let addr = spawn_relay().await;
    let config = config_for(addr);
    let a = join(&config, "red", "aaaa").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _b = join(&config, "blue", "bbbb").await;
    let c = join(&config, "red", "cccc").await;

    assert!(wait_until(|| a.presence().get(&PeerId::from("cccc")).is_some()).await);
    assert!(a.presence().get(&PeerId::from("bbbb")).is_none());
    assert!(c.presence().get(&PeerId::from("bbbb")).is_none());
}

#[tokio::test]
async fn geometry_broadcasts_reach_listeners() {
    let addr = spawn_relay().await;
    let config = config_for(addr);
    let client = join(&config, "geo", "aaaa").await;
    let mut events = client.take_events().await.unwrap();
    assert!(client.take_events().await.is_none());

    let (mut viewer, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/signaling/geo"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let frame = json!({
        "type": GEOMETRY_BROADCAST_TYPE,
        "from": "viewer",
        "data": {"super_nodes": [{"id": "n1"}]},
    });
    viewer.send(Message::Text(frame.to_string())).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(SignalingEvent::Geometry { from, data }) => break (from, data),
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event.0, Some(PeerId::from("viewer")));
    assert_eq!(event.1["super_nodes"][0]["id"], "n1");
}

#[tokio::test]
async fn close_reports_a_single_disconnect() {
    let addr = spawn_relay().await;
    let client = join(&config_for(addr), "bye", "aaaa").await;
    let mut events = client.take_events().await.unwrap();
    assert!(client.is_connected());

    client.close();
    client.close();
    assert!(!client.is_connected());
    assert!(matches!(events.recv().await, Some(SignalingEvent::Disconnected)));
    assert!(events.try_recv().is_err());
}
