use std::sync::Arc;
use std::time::Duration;

use d_template::Dependency;
use d_template::Manager;
use d_template::MemClient;
use d_template::MemCoordinator;
use d_template::Template;
use serde_json::json;

use crate::common::node_config;
use crate::common::wait_until;
use crate::common::ACQUIRE_RETRY_MS;
use crate::common::HEARTBEAT_MS;
use crate::common::LEASE_TTL_MS;

struct Fleet {
    store: MemCoordinator,
    clients: Vec<MemClient>,
    managers: Vec<Manager>,
}

impl Fleet {
    async fn start(
        size: usize,
        template: &Template,
    ) -> Self {
        let store = MemCoordinator::new();
        let mut clients = Vec::new();
        let mut managers = Vec::new();
        for i in 0..size {
            let client = store.client();
            let manager = Manager::new(&node_config(&format!("node-{i}"), true), Arc::new(client.clone())).unwrap();
            manager.start([template.clone()]).await.unwrap();
            clients.push(client);
            managers.push(manager);
        }
        Self {
            store,
            clients,
            managers,
        }
    }

    fn leaders(
        &self,
        template: &Template,
    ) -> Vec<usize> {
        (0..self.managers.len())
            .filter(|i| self.managers[*i].is_leader(template.id()))
            .collect()
    }

    async fn stop(&self) {
        for manager in &self.managers {
            manager.stop().await;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_leader_is_replaced() {
    let upstream = Dependency::service("payments");
    let template = Template::new("/etc/haproxy/payments.tmpl", [upstream.clone()]);
    let fleet = Fleet::start(3, &template).await;
    fleet.store.put_value(&upstream, json!(["10.0.0.1:8443"]));

    assert!(wait_until(Duration::from_secs(2), || fleet.leaders(&template).len() == 1).await);
    let old = fleet.leaders(&template)[0];
    assert!(
        wait_until(Duration::from_secs(2), || {
            fleet.managers.iter().all(|m| m.recall(upstream.id()) == Some(json!(["10.0.0.1:8443"])))
        })
        .await
    );

    fleet.clients[old].set_unavailable(true);
    let bound = Duration::from_millis(LEASE_TTL_MS + HEARTBEAT_MS);
    assert!(
        wait_until(bound, || {
            fleet.leaders(&template).iter().any(|i| *i != old)
        })
        .await
    );
    let new = *fleet.leaders(&template).iter().find(|i| **i != old).unwrap();
    assert!(wait_until(Duration::from_secs(1), || !fleet.managers[old].is_leader(template.id())).await);

    // The new leader watches and publishes; the remaining follower adopts
    fleet.store.put_value(&upstream, json!(["10.0.0.1:8443", "10.0.0.2:8443"]));
    let follower = (0..3).find(|i| *i != old && *i != new).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            fleet.managers[follower].recall(upstream.id()) == Some(json!(["10.0.0.1:8443", "10.0.0.2:8443"]))
        })
        .await
    );
    assert!(fleet.managers[new].watcher().watching(upstream.id()));
    assert!(!fleet.managers[follower].watcher().watching(upstream.id()));

    fleet.clients[old].set_unavailable(false);
    fleet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_followers_keep_secrets_local() {
    let (endpoint, password) = (Dependency::kv("/db/endpoint"), Dependency::secret("secret/data/db"));
    let template = Template::new("db.tmpl", [endpoint.clone(), password.clone()]);
    let fleet = Fleet::start(2, &template).await;
    fleet.store.put_value(&endpoint, json!("db:5432"));
    fleet.store.put_value(&password, json!({"password": "hunter2"}));

    assert!(wait_until(Duration::from_secs(2), || fleet.leaders(&template).len() == 1).await);
    let leader = fleet.leaders(&template)[0];
    let follower = 1 - leader;

    assert!(
        wait_until(Duration::from_secs(2), || {
            let m = &fleet.managers[follower];
            m.recall(endpoint.id()).is_some() && m.recall(password.id()).is_some()
        })
        .await
    );
    assert!(fleet.managers[follower].watcher().watching(password.id()));
    assert!(!fleet.managers[follower].watcher().watching(endpoint.id()));

    fleet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stopping_leader_hands_over_quickly() {
    let dep = Dependency::kv("/handover");
    let template = Template::new("handover.tmpl", [dep.clone()]);
    let fleet = Fleet::start(2, &template).await;

    assert!(wait_until(Duration::from_secs(2), || fleet.leaders(&template).len() == 1).await);
    let leader = fleet.leaders(&template)[0];

    fleet.managers[leader].stop().await;
    let bound = Duration::from_millis(ACQUIRE_RETRY_MS + 50);
    assert!(wait_until(bound, || fleet.leaders(&template) == vec![1 - leader]).await);

    fleet.stop().await;
}
