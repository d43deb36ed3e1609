use anyhow::{Context, Result};
use client::{Client, ClientConfig, EndpointMatch};
use common::Endpoint;
use futures::future::join_all;
use std::env;
use std::time::Duration;
use tracing::{info, warn};

/// Streamgate demo
///
/// Fires a burst of requests at one HTTP/2 (h2c) endpoint and prints the
/// in-use metrics snapshot before and after.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Target from environment: STREAMGATE_TARGET (default: 127.0.0.1:8080)
    let target = env::var("STREAMGATE_TARGET").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let endpoint: Endpoint = target
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid STREAMGATE_TARGET {}: {}", target, e))?;
    let path = env::var("STREAMGATE_PATH").unwrap_or_else(|_| "/".to_string());
    let requests: usize = env::var("STREAMGATE_REQUESTS")
        .unwrap_or_else(|_| "10".to_string())
        .parse()
        .context("Invalid STREAMGATE_REQUESTS")?;

    let mut config = ClientConfig::from_env().context("Failed to load configuration")?;
    if config.metrics.monitored_endpoints.is_empty() {
        config.metrics.monitored_endpoints = vec![EndpointMatch::equals(endpoint.to_string())];
    }
    if config.request_timeout_ms.is_none() {
        config.request_timeout_ms = Some(2_000);
    }

    info!(
        endpoint = %endpoint,
        requests,
        metrics_name = %config.metrics_name,
        "Starting streamgate demo"
    );

    let client = Client::start(config).context("Failed to start client")?;
    let request = client.get(endpoint.port(), endpoint.host(), &path);

    let results = join_all((0..requests).map(|_| request.send())).await;

    let mut ok = 0;
    for result in results {
        match result {
            Ok(response) => {
                ok += 1;
                info!(status = response.status_code(), bytes = response.body.len(), "Response");
            }
            Err(e) => warn!(error = %e, "Request failed"),
        }
    }
    info!(ok, failed = requests - ok, "Burst finished");

    // Let any reset frames flush before reporting
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("{}", serde_json::to_string_pretty(&client.metrics_snapshot_json())?);

    client.stop().await;
    Ok(())
}
