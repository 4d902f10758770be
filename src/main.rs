mod cloud;
mod config;
mod controller;
mod scheduler;
mod sign;
mod web;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cloud::{TuyaClient, ValveCloud};
use config::Settings;
use controller::IrrigationController;
use sign::RequestSigner;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Local deployments keep the credentials in a .env file next to the
    // binary. Absence is fine, the process environment wins either way.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Refuses to start on missing cloud credentials — a gateway that cannot
    // sign requests would fail every single call anyway.
    let settings = Settings::from_env()?;

    let signer = RequestSigner::new(settings.access_id.clone(), settings.secret_key.clone());
    let cloud = Arc::new(TuyaClient::new(
        settings.base_url.clone(),
        settings.device_id.clone(),
        signer,
    ));
    let controller = Arc::new(IrrigationController::new(Arc::clone(&cloud)));

    let state = AppState {
        controller,
        auth: settings.auth.clone(),
    };

    // Diagnostic only: confirms the credentials and device id actually work
    // against the cloud, without blocking or aborting startup.
    tokio::spawn(startup_connection_test(cloud));

    web::serve(state, settings.socket_addr()).await
}

/// Fetch a token and query the device once, logging the outcome.
async fn startup_connection_test(cloud: Arc<TuyaClient>) {
    info!("running cloud connection test");

    let token = match cloud.fetch_access_token().await {
        Ok(token) => token,
        Err(e) => {
            error!("connection test failed at token acquisition: {e}");
            return;
        }
    };

    match cloud.device_info(&token).await {
        Ok(device) => info!(
            name = device.name.as_deref().unwrap_or("<unnamed>"),
            online = device.online,
            "cloud connection test passed — device found"
        ),
        Err(e) => error!("connection test failed at device query: {e}"),
    }
}
