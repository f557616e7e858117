use std::sync::Arc;
use std::time::Duration;

use d_template::metrics;
use d_template::Dependency;
use d_template::Manager;
use d_template::MemCoordinator;
use d_template::Template;
use d_template::ViewState;
use d_template::WatchError;
use futures::StreamExt;
use serde_json::json;

use crate::common::node_config;
use crate::common::wait_until;

#[tokio::test(start_paused = true)]
async fn test_templates_share_views_and_follow_changes() {
    let store = MemCoordinator::new();
    let manager = Manager::new(&node_config("solo", false), Arc::new(store.client())).unwrap();
    let (db, cache, flags) = (
        Dependency::kv("/config/db"),
        Dependency::kv("/config/cache"),
        Dependency::kv_list("/flags"),
    );
    store.put_value(&db, json!("postgres://db:5432"));
    store.put_value(&cache, json!("redis://cache:6379"));

    manager
        .start([
            Template::new("api.tmpl", [db.clone(), cache.clone()]),
            Template::new("worker.tmpl", [db.clone(), flags.clone()]),
        ])
        .await
        .unwrap();
    assert_eq!(manager.watcher().size(), 3);
    assert!(
        wait_until(Duration::from_secs(1), || {
            [&db, &cache, &flags].iter().all(|d| manager.recall(d.id()).is_some())
        })
        .await
    );

    let mut events = manager.events();
    store.put_value(&db, json!("postgres://db-2:5432"));
    assert_eq!(events.next().await, Some(db.id().clone()));
    assert_eq!(manager.recall(db.id()), Some(json!("postgres://db-2:5432")));

    // Rewriting the same value advances the index without an event
    store.put_value(&db, json!("postgres://db-2:5432"));
    store.put_value(&cache, json!("redis://cache-2:6379"));
    assert_eq!(events.next().await, Some(cache.id().clone()));

    manager
        .set_templates([Template::new("worker.tmpl", [db.clone(), flags.clone()])])
        .await
        .unwrap();
    assert_eq!(manager.watcher().size(), 2);
    assert!(manager.recall(cache.id()).is_none());

    assert!(metrics::gather().contains("active_views"));
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_once_mode_stops_views_after_first_value() {
    let store = MemCoordinator::new();
    let mut config = node_config("once", false);
    config.watch.once = true;
    let manager = Manager::new(&config, Arc::new(store.client())).unwrap();
    let dep = Dependency::kv("/once");
    store.put_value(&dep, json!("first"));

    manager.start([Template::new("once.tmpl", [dep.clone()])]).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(1), || {
            manager.watcher().view_info(dep.id()).map(|i| i.state) == Some(ViewState::Stopped)
        })
        .await
    );
    let fetches = store.fetch_count(&dep);

    store.put_value(&dep, json!("second"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.recall(dep.id()), Some(json!("first")));
    assert_eq!(store.fetch_count(&dep), fetches);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_view_is_reported_without_stalling_others() {
    let store = MemCoordinator::new();
    let client = store.client();
    let (broken, healthy) = (Dependency::secret("secret/data/broken"), Dependency::kv("/healthy"));
    client.fail_fetches(&broken, usize::MAX);
    store.put_value(&healthy, json!(true));

    let mut config = node_config("solo", false);
    config.retry.fetch.max_retries = 3;
    let manager = Manager::new(&config, Arc::new(client)).unwrap();
    let mut errors = manager.errors();

    manager
        .start([Template::new("mixed.tmpl", [broken.clone(), healthy.clone()])])
        .await
        .unwrap();

    let error = errors.next().await.unwrap();
    assert!(matches!(error, WatchError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(manager.recall(healthy.id()), Some(json!(true)));

    store.put_value(&healthy, json!(false));
    assert!(wait_until(Duration::from_secs(1), || manager.recall(healthy.id()) == Some(json!(false))).await);

    manager.stop().await;
}
