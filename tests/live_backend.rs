use anyhow::{ensure, Result};
use dotenvy::dotenv;
use media_uplink::config::Settings;
use media_uplink::upload::http::HttpTransport;
use media_uplink::upload::UploadTransport;
use std::path::Path;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::test]
#[ignore = "Requires real backend credentials"]
async fn test_backend_credentials_validation() -> Result<()> {
    load_dotenv();
    init_tracing();

    info!("Starting live validation of backend settings...");
    let settings = Settings::new()?;
    ensure!(!settings.backend_token.is_empty(), "BACKEND_TOKEN missing");
    ensure!(
        settings.backend_endpoint.starts_with("http"),
        "BACKEND_ENDPOINT must be an HTTP(S) URL"
    );

    let transport = HttpTransport::from_settings(&settings);
    let response = transport.probe(&settings.backend_endpoint).await?;
    info!(status = response.status, "backend endpoint answered");
    ensure!(
        response.status != 401 && response.status != 403,
        "backend refused the bearer token (HTTP {})",
        response.status
    );

    info!("Live backend validation passed.");
    Ok(())
}

fn load_dotenv() {
    let env_path = Path::new("../.env");
    if env_path.exists() {
        let _ = dotenvy::from_path(env_path);
    } else {
        dotenv().ok();
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
