use super::backend::CacheBackend;
use super::local_backend::LocalBackend;
use super::service::CacheService;
use std::sync::Arc;
use std::time::Duration;

fn service() -> CacheService {
    CacheService::with_backend(Arc::new(LocalBackend::new()), "test".to_string())
}

#[tokio::test]
async fn test_set_get_del() {
    let cache = service();
    cache.set("k", b"v", None).await.unwrap();
    assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));

    cache.del("k").await.unwrap();
    assert_eq!(cache.get("k").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expiry() {
    let cache = service();
    cache
        .set("short", b"x", Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert!(cache.get("short").await.unwrap().is_some());
    let ttl = cache.ttl("short").await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(5));

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(cache.get("short").await.unwrap().is_none());
    assert!(cache.ttl("short").await.unwrap().is_none());
}

#[tokio::test]
async fn test_set_keepttl_preserves_deadline() {
    let backend = LocalBackend::new();
    backend
        .set("k", b"a", Some(Duration::from_secs(100)))
        .await
        .unwrap();
    backend.set_keepttl("k", b"b").await.unwrap();

    assert_eq!(backend.get("k").await.unwrap(), Some(b"b".to_vec()));
    assert!(backend.ttl("k").await.unwrap().is_some());
}

#[tokio::test]
async fn test_set_nx_semantics() {
    let cache = service();
    assert!(cache.set_nx("lock", b"1", None).await.unwrap());
    assert!(!cache.set_nx("lock", b"2", None).await.unwrap());
    assert_eq!(cache.get("lock").await.unwrap(), Some(b"1".to_vec()));
}

#[tokio::test]
async fn test_compare_swap() {
    let cache = service();
    cache.set("rec", b"v1", None).await.unwrap();

    assert!(cache.compare_swap("rec", b"v1", b"v2").await.unwrap());
    assert!(!cache.compare_swap("rec", b"v1", b"v3").await.unwrap());
    assert_eq!(cache.get("rec").await.unwrap(), Some(b"v2".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn test_expired_events_delivered() {
    let cache = service();
    let mut events = cache.expired_events().await.unwrap();

    cache
        .set("hook:abc", b"", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    cache.set("stays", b"", None).await.unwrap();

    tokio::time::advance(Duration::from_secs(3)).await;

    let key = events.recv().await.unwrap();
    assert_eq!(key, "hook:abc");
    assert!(cache.get("stays").await.unwrap().is_some());
}

#[tokio::test]
async fn test_keys_with_limit_and_namespace() {
    let cache = service();
    for i in 0..5 {
        cache.set(&format!("p:{i}"), b"", None).await.unwrap();
    }
    cache.set("other", b"", None).await.unwrap();

    let keys = cache.keys_with_limit("p:*", 10).await.unwrap();
    assert_eq!(keys.len(), 5);
    assert!(keys.iter().all(|k| k.starts_with("p:")));

    let limited = cache.keys_with_limit("p:*", 2).await.unwrap();
    assert_eq!(limited.len(), 2);
}

#[tokio::test]
async fn test_mget_mixed() {
    let cache = service();
    cache.set("a", b"1", None).await.unwrap();
    cache.set("c", b"3", None).await.unwrap();

    let values = cache.mget(&["a", "b", "c"]).await.unwrap();
    assert_eq!(values[0], Some(b"1".to_vec()));
    assert_eq!(values[1], None);
    assert_eq!(values[2], Some(b"3".to_vec()));
}
