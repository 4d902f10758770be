//! Irrigation decision engine: holds the last-known soil humidity and turns
//! readings into valve actions through a hysteresis band.
//!
//! Open at or below the threshold, close strictly above threshold + margin;
//! readings in between are a dead zone where nothing happens, so the valve
//! never chatters around a single boundary value. The remote platform is the
//! source of truth for valve state — every evaluation re-queries it.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};

use crate::cloud::{CloudError, ValveCloud};
use crate::scheduler::AutoCloseScheduler;

/// Open the valve at or below this humidity percentage.
pub const HUMIDITY_THRESHOLD: f64 = 45.0;
/// Close the valve strictly above threshold + margin.
pub const HUMIDITY_MARGIN: f64 = 5.0;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveAction {
    Open,
    Close,
}

impl ValveAction {
    /// Parse the wire-level `action` field.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "close" => Some(Self::Close),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
        }
    }
}

/// Humidity outside [0, 100] (or not a finite number) never mutates state.
#[derive(Debug, thiserror::Error)]
#[error("humidity reading {0} out of range [0, 100]")]
pub struct InvalidHumidity(pub f64);

/// Failure modes of a manual control request, kept apart so the HTTP layer
/// can report "no token" differently from a remote rejection.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Token inválido o no disponible.")]
    TokenUnavailable(#[source] CloudError),
    #[error("{0}")]
    Command(CloudError),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct IrrigationController<C> {
    cloud: Arc<C>,
    scheduler: AutoCloseScheduler<C>,
    last_humidity: RwLock<f64>,
    threshold: f64,
    margin: f64,
}

impl<C: ValveCloud> IrrigationController<C> {
    pub fn new(cloud: Arc<C>) -> Self {
        Self {
            scheduler: AutoCloseScheduler::new(Arc::clone(&cloud)),
            cloud,
            last_humidity: RwLock::new(0.0),
            threshold: HUMIDITY_THRESHOLD,
            margin: HUMIDITY_MARGIN,
        }
    }

    #[cfg(test)]
    pub(crate) async fn last_humidity(&self) -> f64 {
        *self.last_humidity.read().await
    }

    /// Ingest a sensor reading and immediately run the auto-irrigation
    /// evaluation against it.
    pub async fn record_humidity(&self, value: f64) -> Result<(), InvalidHumidity> {
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(InvalidHumidity(value));
        }

        *self.last_humidity.write().await = value;
        info!(humidity = value, "sensor reading received");

        self.evaluate_auto_irrigation().await;
        Ok(())
    }

    /// Apply the hysteresis logic against the remote valve state.
    ///
    /// A status-query failure reads as closed, so the worst outcome of a
    /// transient error is a redundant open command, never a stuck-open valve
    /// being treated as needing more water.
    pub async fn evaluate_auto_irrigation(&self) {
        let humidity = *self.last_humidity.read().await;
        let is_open = self.cloud.status_or_closed().await;

        if humidity <= self.threshold {
            // Dry soil: start irrigation unless already running. The
            // automatic path never arms the close timer — only manual timed
            // opens do.
            if !is_open {
                info!(
                    humidity,
                    threshold = self.threshold,
                    "humidity at or below threshold — opening valve"
                );
                self.command_valve(true).await;
            }
        } else if humidity > self.threshold + self.margin {
            // Wet soil: stop irrigation if running. A humidity-triggered
            // close always cancels a pending timed close.
            if is_open {
                info!(
                    humidity,
                    close_above = self.threshold + self.margin,
                    "humidity above hysteresis band — closing valve"
                );
                self.command_valve(false).await;
                if self.scheduler.cancel().await {
                    info!("humidity-triggered close cancelled the pending timer");
                }
            }
        }
        // In the dead zone (threshold, threshold + margin] nothing moves.
    }

    /// Handle a manual open/close request from the control endpoint.
    pub async fn manual_control(
        &self,
        action: ValveAction,
        duration_minutes: u64,
    ) -> Result<(), ControlError> {
        let token = self
            .cloud
            .fetch_access_token()
            .await
            .map_err(ControlError::TokenUnavailable)?;

        let open = action == ValveAction::Open;
        self.cloud
            .set_valve(open, &token)
            .await
            .map_err(ControlError::Command)?;

        if open {
            if duration_minutes > 0 {
                self.scheduler.schedule(duration_minutes).await;
            }
        } else {
            // A manual close always clears any pending timed close.
            self.scheduler.cancel().await;
        }
        Ok(())
    }

    /// Best-effort valve command from the automatic path: failures are
    /// logged and the evaluation moves on — the next reading retries.
    async fn command_valve(&self, open: bool) {
        match self.cloud.fetch_access_token().await {
            Ok(token) => {
                if let Err(e) = self.cloud.set_valve(open, &token).await {
                    error!("automatic valve command failed: {e}");
                }
            }
            Err(e) => error!("automatic valve command skipped, no access token: {e}"),
        }
    }

    #[cfg(test)]
    pub(crate) fn scheduler(&self) -> &AutoCloseScheduler<C> {
        &self.scheduler
    }
}

// ===========================================================================
// Tests
// ===========================================================================
