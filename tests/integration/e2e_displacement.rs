use gateway_protocol::{ready::ServerSummary, Frame, Opcode};
use gateway_test_utils::{MockGatewayServer, MockWsClient};
use std::time::Duration;

/// §8 end-to-end scenario 3: two sockets Identify with the same token;
/// exactly one ends up registered, the other gets InvalidSession(false)
/// and is closed.
#[tokio::test]
async fn second_identify_displaces_the_first() {
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
    server.tokens.issue("tok-carol", "carol");

    let mut first = MockWsClient::connect(&server.ws_url()).await.unwrap();
    let _hello = first.recv_frame().await.unwrap();
    first.send_frame(&Frame::identify("tok-carol")).await.unwrap();
    let first_ready = first.recv_frame().await.unwrap();
    assert_eq!(first_ready.t.as_deref(), Some("READY"));

    let mut second = MockWsClient::connect(&server.ws_url()).await.unwrap();
    let _hello = second.recv_frame().await.unwrap();
    second.send_frame(&Frame::identify("tok-carol")).await.unwrap();
    let second_ready = second.recv_frame().await.unwrap();
    assert_eq!(second_ready.t.as_deref(), Some("READY"));

    let displaced = first.recv_frame().await.unwrap();
    assert_eq!(displaced.op, Opcode::InvalidSession);
    assert_eq!(displaced.d.unwrap()["resumable"], false);

    assert!(first.recv_frame().await.is_err(), "displaced socket should be closed");
}
