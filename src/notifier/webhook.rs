use crate::config::{ServiceConfig, WebhookConfig};
use anyhow::{Context, Result};
use reqwest::Method;

/// Calls the configured webhook. Only transport failures are errors; a
/// non-2xx status is the receiver's business.
pub async fn send(
    client: &reqwest::Client,
    service: &ServiceConfig,
    config: &WebhookConfig,
) -> Result<()> {
    tracing::info!(
        service = %service.id,
        method = %config.method,
        url = %config.url,
        "calling webhook"
    );

    let method = Method::from_bytes(config.method.as_bytes())
        .with_context(|| format!("invalid webhook method {:?}", config.method))?;

    let mut request = client
        .request(method, &config.url)
        .body(config.body.clone());
    for (name, values) in &config.headers {
        for value in values {
            request = request.header(name, value);
        }
    }

    let response = request.send().await.context("webhook call failed")?;
    tracing::debug!(
        service = %service.id,
        status = %response.status(),
        "webhook responded"
    );

    Ok(())
}
