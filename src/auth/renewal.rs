// Background silent renewal

use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::manager::Inner;
use crate::error::RenewError;

/// What a renewal check did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RenewOutcome {
    NoSession,
    NotNeeded,
    Renewed,
    /// Renewal failed transiently, existing token still valid
    Kept,
    /// Session was replaced or removed while the renewal was in flight
    Superseded,
    Terminated,
}

/// Spawn the renewal loop; it stops once the manager is dropped
pub(super) fn spawn(inner: Weak<Inner>, check_interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            renew_if_needed(&inner).await;
        }

        tracing::debug!("Renewal task stopped");
    })
}

/// Renew the current user if its token expires within the threshold
pub(super) async fn renew_if_needed(inner: &Inner) -> RenewOutcome {
    let user = match inner.provider.get_current_user().await {
        Ok(Some(user)) => user,
        Ok(None) => return RenewOutcome::NoSession,
        Err(e) => {
            tracing::warn!("Renewal check could not read session state: {:#}", e);
            return RenewOutcome::NoSession;
        }
    };

    if !user.expires_within(inner.settings.renew_threshold) {
        return RenewOutcome::NotNeeded;
    }

    tracing::debug!(
        "Access token expires at {}, renewing...",
        user.expires_at.to_rfc3339()
    );

    match inner.provider.renew(&user).await {
        Ok(renewed) => {
            if inner.replace_user(&user.access_token, &renewed).await {
                RenewOutcome::Renewed
            } else {
                RenewOutcome::Superseded
            }
        }
        Err(RenewError::Transient(e)) if !user.is_expired() => {
            tracing::warn!(
                "Using existing token despite renewal failure (not yet expired): {:#}",
                e
            );
            RenewOutcome::Kept
        }
        Err(e) => {
            tracing::error!("Silent renewal failed, ending session: {}", e);
            if inner.discard_user(&user.access_token).await {
                RenewOutcome::Terminated
            } else {
                RenewOutcome::Superseded
            }
        }
    }
}
