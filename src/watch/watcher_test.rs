use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tracing_test::traced_test;

use crate::test_utils::fast_view_settings;
use crate::test_utils::wait_until;
use crate::Brain;
use crate::Dependency;
use crate::DependencyId;
use crate::MemCoordinator;
use crate::Template;
use crate::TemplateId;
use crate::ViewState;
use crate::WatchError;
use crate::Watcher;

fn watcher(store: &MemCoordinator) -> Watcher {
    Watcher::new(Arc::new(store.client()), Arc::new(Brain::new()), fast_view_settings())
}

fn ids(deps: &[&Dependency]) -> BTreeSet<DependencyId> {
    deps.iter().map(|d| d.id().clone()).collect()
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_set_templates_reference_counts_views() {
    let store = MemCoordinator::new();
    let watcher = watcher(&store);
    let (x, y, z) = (Dependency::kv("/x"), Dependency::kv("/y"), Dependency::kv("/z"));
    let a = Template::new("A", [x.clone(), y.clone()]);
    let b = Template::new("B", [y.clone(), z.clone()]);

    watcher.set_templates([&a, &b]);
    assert_eq!(watcher.dependencies(), ids(&[&x, &y, &z]));
    assert_eq!(watcher.size(), 3);

    let x_before = watcher.view_info(x.id()).unwrap();
    let y_before = watcher.view_info(y.id()).unwrap();

    watcher.set_templates([&a]);
    assert_eq!(watcher.dependencies(), ids(&[&x, &y]));
    assert!(!watcher.watching(z.id()));

    // Surviving views are the same instances
    assert_eq!(watcher.view_info(x.id()).unwrap().instance_id, x_before.instance_id);
    assert_eq!(watcher.view_info(y.id()).unwrap().instance_id, y_before.instance_id);

    watcher.set_templates(Vec::<&Template>::new());
    assert_eq!(watcher.size(), 0);

    watcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_surviving_view_keeps_its_index() {
    let store = MemCoordinator::new();
    let watcher = watcher(&store);
    let (x, z) = (Dependency::kv("/x"), Dependency::kv("/z"));
    store.put_value(&x, json!("x1"));
    let a = Template::new("A", [x.clone()]);
    let b = Template::new("B", [x.clone(), z.clone()]);

    watcher.set_templates([&a, &b]);
    assert!(wait_until(Duration::from_secs(1), || watcher.brain().recall(x.id()).is_some()).await);
    let before = watcher.view_info(x.id()).unwrap();
    let fetches_before = store.fetch_count(&x);

    watcher.set_templates([&a]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = watcher.view_info(x.id()).unwrap();
    assert_eq!(after.instance_id, before.instance_id);
    assert_eq!(after.last_index, before.last_index);
    // Still parked in the same blocking fetch
    assert_eq!(store.fetch_count(&x), fetches_before);

    watcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_add_template_and_remove_template() {
    let store = MemCoordinator::new();
    let watcher = watcher(&store);
    let (x, y) = (Dependency::kv("/x"), Dependency::kv("/y"));

    watcher.add_template(&Template::new("A", [x.clone(), y.clone()]));
    watcher.add_template(&Template::new("B", [y.clone()]));
    assert_eq!(watcher.size(), 2);

    // Replacing A drops x but y is still held by B
    watcher.add_template(&Template::new("A", [y.clone()]));
    assert_eq!(watcher.dependencies(), ids(&[&y]));

    assert!(watcher.remove_template(&TemplateId::from("A")));
    assert!(watcher.watching(y.id()));
    assert!(watcher.remove_template(&TemplateId::from("B")));
    assert!(!watcher.remove_template(&TemplateId::from("B")));
    assert_eq!(watcher.size(), 0);

    watcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_direct_add_is_counted_once() {
    let store = MemCoordinator::new();
    let watcher = watcher(&store);
    let x = Dependency::kv("/x");

    assert!(watcher.add(x.clone()));
    assert!(!watcher.add(x.clone()));
    watcher.add_template(&Template::new("A", [x.clone()]));

    assert!(watcher.remove(x.id()));
    assert!(!watcher.remove(x.id()));
    assert!(watcher.watching(x.id()));

    watcher.remove_template(&TemplateId::from("A"));
    assert!(!watcher.watching(x.id()));

    watcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_events_follow_brain_changes() {
    let store = MemCoordinator::new();
    let watcher = watcher(&store);
    let mut events = watcher.events();
    let x = Dependency::kv("/config/x");
    store.put_value(&x, json!("a"));

    watcher.add(x.clone());
    assert_eq!(events.next().await, Some(x.id().clone()));
    assert_eq!(watcher.brain().recall(x.id()), Some(json!("a")));

    store.put_value(&x, json!("b"));
    assert_eq!(events.next().await, Some(x.id().clone()));
    assert_eq!(watcher.brain().recall(x.id()), Some(json!("b")));

    watcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_dependency_does_not_stall_others() {
    let store = MemCoordinator::new();
    let client = store.client();
    let (bad, good) = (Dependency::kv("/bad"), Dependency::kv("/good"));
    client.fail_fetches(&bad, usize::MAX);
    store.put_value(&good, json!(1));

    let watcher = Watcher::new(Arc::new(client), Arc::new(Brain::new()), fast_view_settings());
    watcher.set_templates([&Template::new("T", [bad.clone(), good.clone()])]);

    assert!(wait_until(Duration::from_secs(1), || watcher.brain().recall(good.id()).is_some()).await);
    store.put_value(&good, json!(2));
    assert!(wait_until(Duration::from_secs(1), || watcher.brain().recall(good.id()) == Some(json!(2))).await);

    let bad_info = watcher.view_info(bad.id()).unwrap();
    assert!(bad_info.error_count > 0);
    assert!(watcher.brain().recall(bad.id()).is_none());

    watcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_errors_stream_reports_exhausted_views() {
    let store = MemCoordinator::new();
    let client = store.client();
    let bad = Dependency::secret("secret/data/missing");
    client.fail_fetches(&bad, usize::MAX);

    let mut settings = fast_view_settings();
    settings.retry.max_retries = 2;
    let watcher = Watcher::new(Arc::new(client), Arc::new(Brain::new()), settings);
    let mut errors = watcher.errors();

    watcher.add(bad.clone());
    let error = errors.next().await.unwrap();
    assert!(matches!(error, WatchError::RetriesExhausted { attempts: 2, .. }));

    assert!(wait_until(Duration::from_secs(1), || {
        watcher.view_info(bad.id()).map(|i| i.state) == Some(ViewState::Stopped)
    })
    .await);

    watcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_final() {
    let store = MemCoordinator::new();
    let watcher = watcher(&store);
    let x = Dependency::kv("/x");
    watcher.add(x.clone());

    watcher.stop().await;
    watcher.stop().await;

    assert_eq!(watcher.size(), 0);
    assert!(!watcher.add(x.clone()));
    watcher.set_templates([&Template::new("A", [x.clone()])]);
    assert_eq!(watcher.size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_views_that_ended_are_restarted_on_reload() {
    let store = MemCoordinator::new();
    let mut settings = fast_view_settings();
    settings.once = true;
    let watcher = Watcher::new(Arc::new(store.client()), Arc::new(Brain::new()), settings);
    let x = Dependency::kv("/x");
    store.put_value(&x, json!("first"));
    let a = Template::new("A", [x.clone()]);

    watcher.set_templates([&a]);
    assert!(
        wait_until(Duration::from_secs(1), || {
            watcher.view_info(x.id()).map(|i| i.state) == Some(ViewState::Stopped)
        })
        .await
    );
    let ended = watcher.view_info(x.id()).unwrap();
    assert!(!watcher.watching(x.id()));
    assert_eq!(watcher.size(), 0);
    assert!(watcher.dependencies().is_empty());

    store.put_value(&x, json!("second"));
    watcher.set_templates([&a]);
    assert!(watcher.watching(x.id()));
    assert_ne!(watcher.view_info(x.id()).unwrap().instance_id, ended.instance_id);
    assert!(wait_until(Duration::from_secs(1), || watcher.brain().recall(x.id()) == Some(json!("second"))).await);

    // The restarted view kept the template's reference: removing it releases the view
    assert!(watcher.remove_template(a.id()));
    assert!(watcher.view_info(x.id()).is_none());

    watcher.stop().await;
}
