//! Periodic reconciliation.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::provisioner::KeyProvisioner;

impl KeyProvisioner {
    /// Runs reconcile passes until `shutdown` resolves.
    ///
    /// Batch size and interval are read from the configuration handle before
    /// every pass, so a hot reload takes effect on the next tick. A failed
    /// pass is logged and retried on the next tick; failures that retrying
    /// cannot fix are logged at error level.
    pub async fn run_loop(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!(worker_id = %self.worker_id(), "reconcile loop started");
        loop {
            let (limit, interval) = {
                let config = self.config().load();
                (
                    config.provisioner.batch_limit,
                    Duration::from_secs(config.provisioner.interval_secs.max(1)),
                )
            };

            match self.reconcile(limit).await {
                Ok(stats) if stats.processed > 0 => info!(
                    processed = stats.processed,
                    success = stats.success,
                    failed = stats.failed,
                    skipped = stats.skipped,
                    "reconcile pass"
                ),
                Ok(_) => debug!("reconcile pass found nothing due"),
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, "reconcile pass failed; retrying next tick");
                }
                Err(err) => error!(error = %err, "reconcile pass failed"),
            }

            tokio::select! {
                () = &mut shutdown => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
        info!(worker_id = %self.worker_id(), "reconcile loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use arc_swap::ArcSwap;
    use std::sync::Arc;
    use std::time::Duration;
    use vkgate_auth::TokenCipher;
    use vkgate_config::Config;
    use vkgate_keyservice::InMemoryKeyService;
    use vkgate_store::InMemoryCredentialStore;
    use vkgate_types::{CredentialStore, KeyService, KeyStatus, KeyType, NewVirtualKey};

    use crate::KeyProvisioner;

    #[tokio::test(start_paused = true)]
    async fn test_loop_picks_up_new_rows_and_stops() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let keys = Arc::new(InMemoryKeyService::new());
        let mut config = Config::default();
        config.provisioner.interval_secs = 10;
        let config = Arc::new(ArcSwap::from_pointee(config));
        let provisioner = Arc::new(KeyProvisioner::new(
            Arc::clone(&store) as Arc<dyn CredentialStore>,
            Arc::clone(&keys) as Arc<dyn KeyService>,
            Arc::new(TokenCipher::from_bytes(&[1u8; 32]).unwrap()),
            Arc::clone(&config),
        ));

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = {
            let provisioner = Arc::clone(&provisioner);
            tokio::spawn(async move {
                provisioner
                    .run_loop(async {
                        let _ = stop_rx.await;
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        store
            .insert_virtual_key(&NewVirtualKey::new("c1", KeyType::User, vec![]), 0)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let row = store.virtual_key("c1", KeyType::User).await.unwrap().unwrap();
        assert_eq!(row.status, KeyStatus::Active);
        assert_eq!(keys.total_generate_calls(), 1);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
