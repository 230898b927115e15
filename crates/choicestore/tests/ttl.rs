use std::sync::Arc;
use std::time::Duration;

use choicestore::{RequestStore, StoreConfig, StoreError, SweepStats};

const TTL: Duration = Duration::from_secs(300);

fn store() -> RequestStore<String> {
    RequestStore::new(StoreConfig::new(TTL))
}

#[tokio::test(start_paused = true)]
async fn put_then_get_before_expiry() {
    let s = store();
    let id = s.put("https://example.com/v".to_string()).await;

    assert_eq!(id.len(), 12);
    let entry = s.get(&id).await.unwrap();
    assert_eq!(entry.value, "https://example.com/v");
    assert_eq!(entry.expires_at - entry.created_at, TTL);
}

#[tokio::test(start_paused = true)]
async fn lookup_after_ttl_is_expired_not_missing() {
    let s = store();
    let id = s.put("u".to_string()).await;

    tokio::time::advance(TTL + Duration::from_millis(1)).await;
    assert_eq!(s.get(&id).await.unwrap_err(), StoreError::Expired);
    assert_eq!(s.claim(&id).await.unwrap_err(), StoreError::Expired);
    assert_eq!(s.get("nope").await.unwrap_err(), StoreError::Missing);
}

#[tokio::test(start_paused = true)]
async fn choice_ten_minutes_after_five_minute_ttl_survives_sweeps() {
    let s = store();
    let id = s.put("u".to_string()).await;

    for _ in 0..10 {
        tokio::time::advance(Duration::from_secs(60)).await;
        s.sweep().await;
    }
    assert_eq!(s.claim(&id).await.unwrap_err(), StoreError::Expired);
}

#[tokio::test(start_paused = true)]
async fn claim_is_exclusive_until_released() {
    let s = Arc::new(store());
    let id = s.put("u".to_string()).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let s = s.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move { s.claim(&id).await.is_ok() }));
    }
    let mut winners = 0;
    for h in handles {
        if h.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(s.claim(&id).await.unwrap_err(), StoreError::Claimed);

    assert!(s.release(&id).await);
    assert!(s.claim(&id).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn removed_ids_are_missing() {
    let s = store();
    let id = s.put("u".to_string()).await;
    s.claim(&id).await.unwrap();

    assert_eq!(s.remove(&id).await.as_deref(), Some("u"));
    assert_eq!(s.get(&id).await.unwrap_err(), StoreError::Missing);
    assert!(!s.release(&id).await);
}

#[tokio::test(start_paused = true)]
async fn sweep_bounds_memory() {
    let s = store();
    for i in 0..50 {
        s.put(format!("u{i}")).await;
    }
    tokio::time::advance(TTL).await;
    let fresh = s.put("fresh".to_string()).await;
    assert_eq!(s.len().await, 51);

    assert_eq!(s.sweep().await, SweepStats { expired: 50, forgotten: 0 });
    assert_eq!(s.len().await, 51);
    assert!(s.get(&fresh).await.is_ok());

    // Tombstones answer Expired until the retention window has passed.
    tokio::time::advance(s.config().expired_retention).await;
    assert_eq!(s.sweep().await, SweepStats { expired: 1, forgotten: 50 });
    assert_eq!(s.len().await, 1);
    assert_eq!(s.get(&fresh).await.unwrap_err(), StoreError::Expired);
}
