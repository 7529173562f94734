use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::{MetricsRegistry, Outcome, RefreshTrigger};

use super::manager::CredentialManager;

/// Run the periodic refresh loop.
///
/// Refreshes the credential every `interval`, starting one interval after the
/// call.  Failures are logged and retried on the next tick; the previous
/// credential keeps serving in the meantime.  Returns once `shutdown` fires.
pub async fn run_periodic_refresh(
    manager: Arc<CredentialManager>,
    interval: Duration,
    metrics: MetricsRegistry,
    shutdown: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "starting credential refresh loop");
    record_expiry(&manager, &metrics);

    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("credential refresh loop stopped");
                return;
            }
            _ = ticker.tick() => refresh_once(&manager, &metrics).await,
        }
    }
}

async fn refresh_once(manager: &CredentialManager, metrics: &MetricsRegistry) {
    info!("refreshing registry credential");
    match manager.refresh().await {
        Ok(credential) => {
            metrics
                .metrics
                .record_refresh(RefreshTrigger::Periodic, Outcome::Success);
            record_expiry(manager, metrics);
            info!(expires_at = %credential.expires_at(), "registry credential refreshed");
        }
        Err(e) => {
            metrics
                .metrics
                .record_refresh(RefreshTrigger::Periodic, Outcome::Failure);
            if manager.is_valid() {
                warn!(error = %e, "credential refresh failed, keeping current credential");
            } else {
                error!(error = %e, "credential refresh failed and current credential is due");
            }
        }
    }
}

fn record_expiry(manager: &CredentialManager, metrics: &MetricsRegistry) {
    metrics
        .metrics
        .credential_expiry_timestamp_seconds
        .set(manager.snapshot().expires_at().timestamp());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::manager::testing::FakeSource;

    #[tokio::test(start_paused = true)]
    async fn refreshes_on_each_tick_until_cancelled() {
        let source = FakeSource::new();
        let manager = Arc::new(CredentialManager::new(source.clone()).await.unwrap());
        let metrics = MetricsRegistry::new();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_periodic_refresh(
            Arc::clone(&manager),
            Duration::from_secs(60),
            metrics.clone(),
            shutdown.clone(),
        ));

        // No immediate refresh: the initial fetch is still current.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.calls(), 1);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(source.calls(), 3);
        assert_eq!(manager.current_token().await.unwrap(), "token-3");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_keep_the_loop_alive() {
        let source = FakeSource::new();
        let manager = Arc::new(CredentialManager::new(source.clone()).await.unwrap());
        let metrics = MetricsRegistry::new();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_periodic_refresh(
            Arc::clone(&manager),
            Duration::from_secs(10),
            metrics.clone(),
            shutdown.clone(),
        ));

        source.set_failing(true);
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(source.calls(), 3);
        assert_eq!(manager.snapshot().token(), "token-1");

        source.set_failing(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(manager.snapshot().token(), "token-4");

        let text = metrics.encode().unwrap();
        assert!(text.contains("outcome=\"Failure\""));
        assert!(text.contains("outcome=\"Success\""));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
