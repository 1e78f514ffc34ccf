use gateway_core::permissions::{PermissionCache, PermissionInvalidator};
use gateway_test_utils::MockGatewayServer;
use std::time::Duration;

/// §8 end-to-end scenario 6: node A caches a permission mask; node B
/// publishes a cache-invalidate message scoped to that user+channel; node
/// A's subscriber removes exactly that key.
#[tokio::test]
async fn cache_invalidate_message_clears_the_targeted_key() {
    let server = MockGatewayServer::start().await;

    let node_a_cache = std::sync::Arc::new(PermissionCache::new(server.kv.clone()));
    node_a_cache.set("u", Some("c"), 7).await.unwrap();
    assert_eq!(node_a_cache.get("u", Some("c")).await.unwrap(), Some(7));

    let subscriber_cache = node_a_cache.clone();
    let node_a_invalidator = PermissionInvalidator::new(server.bus());
    let run_handle = {
        let invalidator = PermissionInvalidator::new(server.bus());
        tokio::spawn(async move { invalidator.run(subscriber_cache).await })
    };
    // give the subscriber a moment to register before node B publishes.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let node_b_invalidator = PermissionInvalidator::new(server.bus());
    node_b_invalidator.invalidate_user_channel("u", "c").await.unwrap();

    for _ in 0..50 {
        if node_a_cache.get("u", Some("c")).await.unwrap().is_none() {
            run_handle.abort();
            let _ = node_a_invalidator.invalidate_all().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("cache entry was never invalidated");
}
