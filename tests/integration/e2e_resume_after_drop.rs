use gateway_core::pubsub::PubSub;
use gateway_protocol::{ready::ServerSummary, Frame, Opcode};
use gateway_test_utils::{MockGatewayServer, MockWsClient};
use std::time::Duration;

/// §8 end-to-end scenario 2: drop the socket after a few dispatches,
/// resume with a stale client seq, and get the gap replayed followed by
/// RESUMED, with the old session key gone afterwards.
#[tokio::test]
async fn resume_replays_missed_frames_then_resumed() {
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
    server.tokens.issue("tok-bob", "bob");

    let mut client = MockWsClient::connect(&server.ws_url()).await.unwrap();
    let _hello = client.recv_frame().await.unwrap();
    client.send_frame(&Frame::identify("tok-bob")).await.unwrap();
    let ready = client.recv_frame().await.unwrap();
    assert_eq!(ready.s, Some(1));
    let session_id = ready.d.unwrap()["session_id"].as_str().unwrap().to_string();

    for i in 0..4 {
        publish_dispatch(&server, "MESSAGE_CREATE", serde_json::json!({"n": i})).await;
    }
    for expected_seq in 2..=5 {
        let frame = client.recv_frame().await.unwrap();
        assert_eq!(frame.s, Some(expected_seq));
    }

    client.close().await.ok();
    drop(client);

    let mut resumed = MockWsClient::connect(&server.ws_url()).await.unwrap();
    let _hello = resumed.recv_frame().await.unwrap();
    resumed.send_frame(&Frame::resume("tok-bob", session_id.clone(), 3)).await.unwrap();

    let replayed_one = resumed.recv_frame().await.unwrap();
    assert_eq!(replayed_one.s, Some(4));
    let replayed_two = resumed.recv_frame().await.unwrap();
    assert_eq!(replayed_two.s, Some(5));

    let resumed_frame = resumed.recv_frame().await.unwrap();
    assert_eq!(resumed_frame.op, Opcode::Dispatch);
    assert_eq!(resumed_frame.t.as_deref(), Some("RESUMED"));
    assert_eq!(resumed_frame.s, Some(6));

    assert!(server.kv.get(&format!("session:{session_id}")).await.unwrap().is_none());
}

async fn publish_dispatch(server: &MockGatewayServer, event_type: &str, data: serde_json::Value) {
    let envelope = serde_json::json!({"t": event_type, "d": data});
    server.bus().publish("gateway-events", serde_json::to_vec(&envelope).unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
}
