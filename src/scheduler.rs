//! Deferred valve close: a manual "open for N minutes" arms a single timer
//! that closes the valve when it fires.
//!
//! At most one timer is ever pending. Arming a new one always cancels and
//! replaces the previous one, and both manual and humidity-triggered closes
//! cancel it outright. The fired task fetches a **fresh** access token —
//! a token captured at schedule time would be expired long before a
//! multi-minute timer fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cloud::ValveCloud;

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    pending: Option<Pending>,
    next_generation: u64,
}

/// Owns the pending-timer slot. All operations serialize through the inner
/// mutex, so a sensor-triggered cancel and a manual-triggered schedule racing
/// for the valve observe each other's effects.
pub struct AutoCloseScheduler<C> {
    cloud: Arc<C>,
    slot: Arc<Mutex<Slot>>,
}

impl<C: ValveCloud> AutoCloseScheduler<C> {
    pub fn new(cloud: Arc<C>) -> Self {
        Self {
            cloud,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Arm the close timer, replacing any pending one.
    pub async fn schedule(&self, duration_minutes: u64) {
        let mut slot = self.slot.lock().await;

        if let Some(previous) = slot.pending.take() {
            previous.handle.abort();
            info!("previous close timer cancelled");
        }

        let generation = slot.next_generation;
        slot.next_generation += 1;

        let delay = Duration::from_secs(duration_minutes.saturating_mul(60));
        info!(duration_minutes, "valve open — automatic close scheduled");

        let cloud = Arc::clone(&self.cloud);
        let shared_slot = Arc::clone(&self.slot);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!(duration_minutes, "close timer elapsed — issuing automatic close");

            match cloud.fetch_access_token().await {
                Ok(token) => {
                    if let Err(e) = cloud.set_valve(false, &token).await {
                        error!("scheduled close failed: {e}");
                    }
                }
                // Not retried: the next humidity reading or manual command
                // is the recovery path.
                Err(e) => error!("scheduled close abandoned, no access token: {e}"),
            }

            // Clear the slot only if it still holds this timer; a
            // replacement scheduled while we were closing owns it now.
            let mut slot = shared_slot.lock().await;
            if slot
                .pending
                .as_ref()
                .is_some_and(|p| p.generation == generation)
            {
                slot.pending = None;
            }
        });

        slot.pending = Some(Pending { generation, handle });
    }

    /// Cancel the pending timer if any. Returns whether one was cancelled.
    pub async fn cancel(&self) -> bool {
        let mut slot = self.slot.lock().await;
        match slot.pending.take() {
            Some(previous) => {
                previous.handle.abort();
                info!("pending close timer cancelled");
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) async fn is_pending(&self) -> bool {
        self.slot.lock().await.pending.is_some()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloud;

    /// Advance the paused test clock past `secs` and let the timer task run
    /// to completion.
    async fn advance_secs(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    // -- Firing -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn timer_fires_and_closes_valve() {
        let cloud = Arc::new(MockCloud::with_valve_open(true));
        let scheduler = AutoCloseScheduler::new(Arc::clone(&cloud));

        scheduler.schedule(5).await;
        assert!(scheduler.is_pending().await);

        advance_secs(5 * 60 + 1).await;

        assert_eq!(cloud.commands(), vec![false]);
        assert!(!scheduler.is_pending().await);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_does_not_fire_early() {
        let cloud = Arc::new(MockCloud::with_valve_open(true));
        let scheduler = AutoCloseScheduler::new(Arc::clone(&cloud));

        scheduler.schedule(5).await;
        advance_secs(4 * 60).await;

        assert!(cloud.commands().is_empty());
        assert!(scheduler.is_pending().await);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_duration_saturates_instead_of_overflowing() {
        let cloud = Arc::new(MockCloud::with_valve_open(true));
        let scheduler = AutoCloseScheduler::new(Arc::clone(&cloud));

        // duration_minutes * 60 would overflow u64 here; the delay must
        // saturate and the timer simply never fires within any real horizon.
        scheduler.schedule(u64::MAX / 2).await;
        assert!(scheduler.is_pending().await);

        advance_secs(60 * 60).await;
        assert!(cloud.commands().is_empty());
        assert!(scheduler.is_pending().await);
    }

    // -- Replacement ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending_timer() {
        let cloud = Arc::new(MockCloud::with_valve_open(true));
        let scheduler = AutoCloseScheduler::new(Arc::clone(&cloud));

        scheduler.schedule(5).await;
        scheduler.schedule(10).await;

        // Past the first deadline: the replaced timer must not fire.
        advance_secs(6 * 60).await;
        assert!(cloud.commands().is_empty());
        assert!(scheduler.is_pending().await);

        // Past the second deadline: exactly one close.
        advance_secs(5 * 60).await;
        assert_eq!(cloud.commands(), vec![false]);
        assert!(!scheduler.is_pending().await);
    }

    // -- Cancellation --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let cloud = Arc::new(MockCloud::with_valve_open(true));
        let scheduler = AutoCloseScheduler::new(Arc::clone(&cloud));

        scheduler.schedule(5).await;
        assert!(scheduler.cancel().await);
        assert!(!scheduler.is_pending().await);

        advance_secs(10 * 60).await;
        assert!(cloud.commands().is_empty());
    }

    #[tokio::test]
    async fn cancel_on_empty_scheduler_is_noop() {
        let cloud = Arc::new(MockCloud::new());
        let scheduler = AutoCloseScheduler::new(cloud);

        assert!(!scheduler.cancel().await);
        assert!(!scheduler.cancel().await);
    }

    // -- Token failure at fire time ------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn fired_timer_without_token_abandons_close() {
        use std::sync::atomic::Ordering;

        let cloud = Arc::new(MockCloud::with_valve_open(true));
        let scheduler = AutoCloseScheduler::new(Arc::clone(&cloud));

        scheduler.schedule(1).await;
        // Token expires between scheduling and firing.
        cloud.token_available.store(false, Ordering::SeqCst);

        advance_secs(61).await;

        // No command issued, and the slot is still cleared.
        assert!(cloud.commands().is_empty());
        assert!(!scheduler.is_pending().await);
    }
}
