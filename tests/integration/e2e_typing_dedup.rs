use gateway_core::presence::PresenceSubstore;
use gateway_core::pubsub::PubSub;
use gateway_protocol::{ready::ServerSummary, Frame};
use gateway_test_utils::{MockGatewayServer, MockWsClient};
use std::time::Duration;

/// §8 end-to-end scenario 5: SetTyping dedups repeat calls within its TTL,
/// and the resulting TYPING_START dispatch never consumes a sequence
/// number (ephemeral event types per §3).
#[tokio::test]
async fn typing_dedups_within_window_and_stays_unsequenced() {
    let server = MockGatewayServer::start().await;
    server
        .kv
        .set(
            "server:config",
            serde_json::to_vec(&ServerSummary { id: "srv1".into(), name: "Test Server".into() }).unwrap(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    server.tokens.issue("tok-finn", "finn");

    let mut client = MockWsClient::connect(&server.ws_url()).await.unwrap();
    let _hello = client.recv_frame().await.unwrap();
    client.send_frame(&Frame::identify("tok-finn")).await.unwrap();
    let ready = client.recv_frame().await.unwrap();
    assert_eq!(ready.s, Some(1));

    let presence = PresenceSubstore::new(server.kv.clone());
    assert!(presence.set_typing("chan-2", "someone-typing").await.unwrap(), "first ping must create the marker");
    assert!(
        !presence.set_typing("chan-2", "someone-typing").await.unwrap(),
        "repeat ping within the TTL must be deduped"
    );
    assert!(presence.is_typing("chan-2", "someone-typing").await.unwrap());

    let envelope = serde_json::json!({"t": "TYPING_START", "d": {"channel_id": "chan-2", "user_id": "someone-typing"}});
    server.bus().publish("gateway-events", serde_json::to_vec(&envelope).unwrap()).await.unwrap();

    let typing_frame = client.recv_frame().await.unwrap();
    assert_eq!(typing_frame.t.as_deref(), Some("TYPING_START"));
    assert!(typing_frame.s.is_none(), "ephemeral dispatch must not carry a sequence number");

    let envelope = serde_json::json!({"t": "MESSAGE_CREATE", "d": {}});
    server.bus().publish("gateway-events", serde_json::to_vec(&envelope).unwrap()).await.unwrap();
    let next_sequenced = client.recv_frame().await.unwrap();
    assert_eq!(next_sequenced.s, Some(2), "typing dispatch must not have perturbed the sequence counter");
}
