//! Multiple workers and callers racing on one SQLite database.

use arc_swap::ArcSwap;
use std::sync::Arc;
use vkgate_auth::TokenCipher;
use vkgate_config::Config;
use vkgate_keyservice::InMemoryKeyService;
use vkgate_provisioner::{KeyProvisioner, ProvisionOutcome};
use vkgate_store::SqliteCredentialStore;
use vkgate_types::{CredentialStore, KeyService, KeyStatus, KeyType};

async fn file_store(dir: &tempfile::TempDir) -> Arc<SqliteCredentialStore> {
    let url = format!("sqlite://{}", dir.path().join("vkgate.db").display());
    Arc::new(SqliteCredentialStore::new(&url).await.unwrap())
}

fn provisioner(
    store: &Arc<SqliteCredentialStore>,
    keys: &Arc<InMemoryKeyService>,
    worker: usize,
) -> KeyProvisioner {
    let mut config = Config::from_yaml("router:\n  tiers:\n    chat: fast\n").unwrap();
    config.keys.system_models = vec!["gpt-small".into()];
    KeyProvisioner::new(
        Arc::clone(store) as Arc<dyn CredentialStore>,
        Arc::clone(keys) as Arc<dyn KeyService>,
        Arc::new(TokenCipher::from_bytes(&[5u8; 32]).unwrap()),
        Arc::new(ArcSwap::from_pointee(config)),
    )
    .with_worker_id(format!("worker-{worker}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_provision_creates_one_row_per_key_type() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir).await;
    let keys = Arc::new(InMemoryKeyService::new());

    let tasks: Vec<_> = (0..12)
        .map(|i| {
            let p = provisioner(&store, &keys, i);
            tokio::spawn(async move { p.provision_caller("alice").await })
        })
        .collect();

    let mut created = 0;
    for task in futures::future::join_all(tasks).await {
        let outcomes = task.unwrap().expect("no duplicate-key error escapes");
        created += outcomes
            .iter()
            .filter(|(_, o)| *o == ProvisionOutcome::Created)
            .count();
    }
    assert_eq!(created, 2);

    let rows = store.list_virtual_keys(Some("alice")).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|r| r.key_type == KeyType::User));
    assert!(rows.iter().any(|r| r.key_type == KeyType::System));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reconcile_never_double_provisions() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir).await;
    let keys = Arc::new(InMemoryKeyService::new());

    let seeder = provisioner(&store, &keys, 0);
    for caller in 0..20 {
        seeder.provision_caller(&format!("caller-{caller}")).await.unwrap();
    }

    let workers: Vec<_> = (1..=4)
        .map(|i| {
            let p = provisioner(&store, &keys, i);
            tokio::spawn(async move { p.reconcile(15).await })
        })
        .collect();
    let mut success = 0;
    for stats in futures::future::join_all(workers).await {
        success += stats.unwrap().unwrap().success;
    }
    // Anything left over goes to a final pass.
    success += seeder.reconcile(100).await.unwrap().success;
    assert_eq!(success, 40);

    let rows = store.list_virtual_keys(None).await.unwrap();
    assert_eq!(rows.len(), 40);
    for row in rows {
        assert_eq!(row.status, KeyStatus::Active);
        assert_eq!(keys.generate_calls(&row.key_alias), 1, "{}", row.key_alias);
    }
    assert_eq!(keys.total_generate_calls(), 40);
}
