use gateway_protocol::{ready::ServerSummary, Frame, Opcode};
use gateway_test_utils::{MockGatewayServer, MockWsClient};
use std::time::Duration;

/// §8 end-to-end scenario 1: connect, receive Hello, Identify, receive
/// READY at seq 1, and see presence recorded online.
#[tokio::test]
async fn happy_identify_reaches_ready_and_marks_presence_online() {
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
    server.tokens.issue("tok-alice", "alice");

    let mut client = MockWsClient::connect(&server.ws_url()).await.unwrap();

    let hello = client.recv_frame().await.unwrap();
    assert_eq!(hello.op, Opcode::Hello);
    assert_eq!(hello.d.unwrap()["heartbeat_interval"], 45000);

    client.send_frame(&Frame::identify("tok-alice")).await.unwrap();

    let ready = client.recv_frame().await.unwrap();
    assert_eq!(ready.op, Opcode::Dispatch);
    assert_eq!(ready.s, Some(1));
    assert_eq!(ready.t.as_deref(), Some("READY"));
    let session_id = ready.d.unwrap()["session_id"].as_str().unwrap().to_string();
    assert!(!session_id.is_empty());

    let presence = wait_for_presence(&server, "alice").await;
    let record: serde_json::Value = serde_json::from_slice(&presence).unwrap();
    assert_eq!(record["status"], "online");
}

async fn wait_for_presence(server: &MockGatewayServer, user_id: &str) -> Vec<u8> {
    let key = format!("presence:{user_id}");
    for _ in 0..50 {
        if let Some(bytes) = server.kv.get(&key).await.unwrap() {
            return bytes;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("presence for {user_id} never appeared");
}
