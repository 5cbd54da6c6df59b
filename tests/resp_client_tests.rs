//! RESP client and service against a fake shard over TCP

mod common;

use common::mock_server::MockShard;
use common::test_settings;
use std::sync::Arc;
use std::time::Duration;
use visit_counter::store::{ClientOptions, RespClient, ShardClient};
use visit_counter::{
    BreakerSettings, Config, CounterError, CounterService, Metrics, ReadSource, ShardPool,
};

fn options(timeout_ms: u64) -> ClientOptions {
    ClientOptions {
        timeout: Duration::from_millis(timeout_ms),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_incr_by_get_and_ping() {
    let shard = MockShard::start().await;
    let client = RespClient::new(&shard.url(), &options(1000)).unwrap();

    assert_eq!(client.get("page:1:visits").await.unwrap(), None);
    assert_eq!(client.incr_by("page:1:visits", 5).await.unwrap(), 5);
    assert_eq!(client.incr_by("page:1:visits", 2).await.unwrap(), 7);
    assert_eq!(client.get("page:1:visits").await.unwrap(), Some(7));
    client.ping().await.unwrap();

    assert_eq!(shard.value("page:1:visits"), Some(7));
    assert_eq!(
        shard.commands()[1],
        vec!["INCRBY".to_string(), "page:1:visits".to_string(), "5".to_string()]
    );
}

#[tokio::test]
async fn test_connection_is_reused() {
    let shard = MockShard::start().await;
    let client = RespClient::new(&shard.url(), &options(1000)).unwrap();

    assert!(!client.is_connected().await);
    for _ in 0..10 {
        client.incr_by("k", 1).await.unwrap();
    }
    assert!(client.is_connected().await);
    assert_eq!(shard.value("k"), Some(10));
}

#[tokio::test]
async fn test_auth_and_select_on_connect() {
    let shard = MockShard::start_with_password("hunter2").await;
    let url = shard.url().replace("redis://", "redis://:hunter2@") + "/3";
    let client = RespClient::new(&url, &options(1000)).unwrap();

    client.incr_by("k", 1).await.unwrap();

    let commands = shard.commands();
    assert_eq!(commands[0], vec!["AUTH", "hunter2"]);
    assert_eq!(commands[1], vec!["SELECT", "3"]);
    assert_eq!(commands[2][0], "INCRBY");
}

#[tokio::test]
async fn test_wrong_password_is_store_error() {
    let shard = MockShard::start_with_password("hunter2").await;
    let client = RespClient::new(
        &shard.url(),
        &ClientOptions {
            password: Some("wrong".to_string()),
            ..options(1000)
        },
    )
    .unwrap();

    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, CounterError::StoreError { .. }), "{}", err);
    assert!(err.to_string().contains("AUTH rejected"));
}

#[tokio::test]
async fn test_non_integer_value_is_store_error() {
    let shard = MockShard::start().await;
    let client = RespClient::new(&shard.url(), &options(1000)).unwrap();
    shard.insert("k", "not-a-number");

    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, CounterError::StoreError { .. }), "{}", err);
    let err = client.incr_by("k", 1).await.unwrap_err();
    assert!(matches!(err, CounterError::StoreError { .. }), "{}", err);
    assert!(!err.is_transient());

    // The connection survives an error reply
    shard.insert("k", "41");
    assert_eq!(client.incr_by("k", 1).await.unwrap(), 42);
}

#[tokio::test]
async fn test_silent_shard_times_out_and_recovers() {
    let shard = MockShard::start().await;
    let client = RespClient::new(&shard.url(), &options(100)).unwrap();

    client.incr_by("k", 1).await.unwrap();

    shard.set_silent(true);
    let err = client.incr_by("k", 1).await.unwrap_err();
    assert!(err.is_transient());
    assert!(err.to_string().contains("timed out"), "{}", err);
    assert!(!client.is_connected().await);

    shard.set_silent(false);
    // A fresh connection, so no stale reply is mistaken for this one
    assert_eq!(client.get("k").await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_abandoned_call_does_not_leak_its_reply() {
    let shard = MockShard::start().await;
    let client = RespClient::new(&shard.url(), &options(1000)).unwrap();
    shard.insert("a", "10");

    shard.set_reply_delay(Duration::from_millis(300));
    let abandoned = tokio::time::timeout(Duration::from_millis(50), client.get("a")).await;
    assert!(abandoned.is_err());
    assert!(!client.is_connected().await);

    shard.set_reply_delay(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.get("b").await.unwrap(), None);
    assert_eq!(client.get("a").await.unwrap(), Some(10));
}

#[tokio::test]
async fn test_abandoned_incr_by_is_not_counted_twice() {
    let shard = MockShard::start().await;
    let client = RespClient::new(&shard.url(), &options(1000)).unwrap();

    shard.set_reply_delay(Duration::from_millis(300));
    let abandoned = tokio::time::timeout(Duration::from_millis(50), client.incr_by("k", 5)).await;
    assert!(abandoned.is_err());

    shard.set_reply_delay(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.incr_by("other", 1).await.unwrap(), 1);
    assert_eq!(shard.value("k"), Some(5));
}

#[tokio::test]
async fn test_read_of_healthy_shard_does_not_wait_for_stalled_flush() {
    let healthy = MockShard::start().await;
    let stalled = MockShard::start().await;
    let store_timeout = Duration::from_millis(1000);

    let clients: Vec<(String, Arc<dyn ShardClient>)> = [&healthy, &stalled]
        .iter()
        .map(|shard| {
            let client: Arc<dyn ShardClient> =
                Arc::new(RespClient::new(&shard.url(), &options(1000)).unwrap());
            (shard.url(), client)
        })
        .collect();
    let pool = ShardPool::from_clients(100, clients, BreakerSettings::default()).unwrap();
    let service = Arc::new(CounterService::new(pool, test_settings(), Arc::new(Metrics::new())));

    let on_shard = |url: String| {
        (0..)
            .map(|i| format!("page:{}:visits", i))
            .find(|key| service.locate(key).unwrap() == url)
            .unwrap()
    };
    let healthy_key = on_shard(healthy.url());
    let stalled_key = on_shard(stalled.url());

    healthy.insert(&healthy_key, "7");
    service.increment_by(&healthy_key, 1);
    service.increment_by(&stalled_key, 2);

    stalled.set_silent(true);
    let flushing = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.flush().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!flushing.is_finished());

    let started = std::time::Instant::now();
    let reading = service.get_count(&healthy_key).await.unwrap();
    assert!(started.elapsed() < store_timeout / 2, "read waited {:?}", started.elapsed());
    assert_eq!(reading.value, 8);

    let report = flushing.await.unwrap();
    assert_eq!(report.keys_flushed, 1);
    assert_eq!(report.keys_failed, 1);
    assert_eq!(service.buffer().pending(&stalled_key), 2);
}

#[tokio::test]
async fn test_flush_after_timeout_is_at_least_once() {
    let shard = MockShard::start().await;
    let client: Arc<dyn ShardClient> = Arc::new(RespClient::new(&shard.url(), &options(100)).unwrap());
    let pool = ShardPool::from_clients(
        10,
        vec![(shard.url(), client)],
        BreakerSettings::default(),
    )
    .unwrap();
    let service = CounterService::new(pool, test_settings(), Arc::new(Metrics::new()));

    service.increment_by("k", 3);
    shard.set_silent(true);
    let report = service.flush().await;
    assert_eq!(report.keys_failed, 1);
    assert_eq!(service.buffer().pending("k"), 3);

    shard.set_silent(false);
    let report = service.flush().await;
    assert!(report.is_complete());
    // The silent shard applied the first INCRBY without answering
    assert_eq!(shard.value("k"), Some(6));
    assert_eq!(shard.count_commands("INCRBY"), 2);
}

#[tokio::test]
async fn test_service_from_config_end_to_end() {
    let shard_a = MockShard::start().await;
    let shard_b = MockShard::start().await;

    let mut config = Config::default();
    config.shards.nodes = vec![shard_a.url(), shard_b.url()];
    config.store.timeout_ms = 1000;
    config.validate().unwrap();

    let service = CounterService::connect(&config).unwrap();
    for _ in 0..3 {
        service.record_visit("A").unwrap();
    }

    let first = service.visit_count("A").await.unwrap();
    assert_eq!((first.value, first.source), (3, ReadSource::Store));
    let second = service.visit_count("A").await.unwrap();
    assert_eq!((second.value, second.source), (3, ReadSource::Cache));

    let owner = service.locate("page:A:visits").unwrap();
    let (owning, other) = if owner == shard_a.url() {
        (&shard_a, &shard_b)
    } else {
        (&shard_b, &shard_a)
    };
    assert_eq!(owning.value("page:A:visits"), None);

    let report = service.shutdown().await;
    assert_eq!(report.increments_flushed, 3);
    assert_eq!(owning.value("page:A:visits"), Some(3));
    assert_eq!(other.count_commands("INCRBY"), 0);

    let health = service.health_check().await;
    assert!(health.iter().all(|h| h.healthy));
}
