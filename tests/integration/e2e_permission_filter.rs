use gateway_core::pubsub::PubSub;
use gateway_protocol::{ready::ServerSummary, Frame};
use gateway_test_utils::{MockGatewayServer, MockWsClient};
use std::time::Duration;

/// §8 end-to-end scenario 4: a channel-scoped dispatch only reaches
/// connections whose FilterPermitted passes for that channel.
#[tokio::test]
async fn channel_scoped_dispatch_is_filtered_by_permission() {
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
    server.tokens.issue("tok-dave", "dave");
    server.tokens.issue("tok-erin", "erin");
    // dave can view the channel; erin has no role granting VIEW_CHANNELS.
    server.permissions.set_channel("chan-1", None);
    server.permissions.set_roles(
        "dave",
        vec![gateway_core::collab::RolePermission { role_id: 1, allow_bits: gateway_core::permissions::bits::VIEW_CHANNELS }],
    );
    server.permissions.set_roles("erin", vec![]);

    let mut dave = MockWsClient::connect(&server.ws_url()).await.unwrap();
    let _hello = dave.recv_frame().await.unwrap();
    dave.send_frame(&Frame::identify("tok-dave")).await.unwrap();
    let _ready = dave.recv_frame().await.unwrap();

    let mut erin = MockWsClient::connect(&server.ws_url()).await.unwrap();
    let _hello = erin.recv_frame().await.unwrap();
    erin.send_frame(&Frame::identify("tok-erin")).await.unwrap();
    let _ready = erin.recv_frame().await.unwrap();

    let envelope = serde_json::json!({"t": "MESSAGE_CREATE", "d": {"channel_id": "chan-1", "text": "hi"}});
    server.bus().publish("gateway-events", serde_json::to_vec(&envelope).unwrap()).await.unwrap();

    let dave_frame = dave.recv_frame().await.unwrap();
    assert_eq!(dave_frame.t.as_deref(), Some("MESSAGE_CREATE"));
    assert_eq!(dave_frame.s, Some(2));

    let outcome = tokio::time::timeout(Duration::from_millis(300), erin.recv_frame()).await;
    assert!(outcome.is_err(), "erin must not receive the filtered dispatch");
}
