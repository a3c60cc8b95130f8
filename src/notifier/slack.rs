use crate::config::{ServiceConfig, SlackConfig};
use crate::store::encode_timestamp;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

/// Posts an alert or recovery message to Slack as a single attachment.
pub async fn send(
    client: &reqwest::Client,
    service: &ServiceConfig,
    config: &SlackConfig,
    last_heartbeat: Option<DateTime<Utc>>,
    is_recovery: bool,
) -> Result<()> {
    tracing::info!(
        service = %service.id,
        channel = %config.channel,
        "sending slack message"
    );

    let payload = message_payload(service, config, last_heartbeat, is_recovery);
    let response = client
        .post(POST_MESSAGE_URL)
        .bearer_auth(&config.token)
        .json(&payload)
        .send()
        .await
        .context("slack call failed")?;

    // Slack reports failures in the body, not the status code.
    let body: Value = response
        .json()
        .await
        .context("failed to read slack response")?;
    if body.get("ok").and_then(Value::as_bool) != Some(true) {
        let reason = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        bail!("slack rejected the message: {reason}");
    }

    Ok(())
}

fn message_payload(
    service: &ServiceConfig,
    config: &SlackConfig,
    last_heartbeat: Option<DateTime<Utc>>,
    is_recovery: bool,
) -> Value {
    let (title, color, text) = if is_recovery {
        (
            "RECOVERY",
            "good",
            format!("The service {} started sending heartbeats again", service.id),
        )
    } else {
        (
            "ALERT",
            "danger",
            format!("The service {} has stopped sending heartbeats", service.id),
        )
    };

    let mut fields = vec![json!({ "title": "service", "value": service.id })];
    if let Some(last_heartbeat) = last_heartbeat {
        fields.push(json!({
            "title": "last heartbeat",
            "value": encode_timestamp(last_heartbeat),
        }));
    }
    for field in &config.message_fields {
        fields.push(json!({ "title": field.key, "value": field.value }));
    }

    json!({
        "channel": config.channel,
        "as_user": true,
        "attachments": [{
            "title": title,
            "color": color,
            "text": text,
            "fields": fields,
        }],
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::MessageField;
    use std::time::Duration;

    fn service() -> ServiceConfig {
        ServiceConfig {
            id: "svc-1".to_string(),
            token: String::new(),
            timeout: Duration::from_secs(30),
            debounce: Duration::ZERO,
            alert_notifications: vec![],
            recovery_notifications: vec![],
        }
    }

    fn slack_config() -> SlackConfig {
        SlackConfig {
            token: "xoxb-1".to_string(),
            channel: "#ops".to_string(),
            message_fields: vec![MessageField {
                key: "env".to_string(),
                value: "prod".to_string(),
            }],
        }
    }

    #[test]
    fn alert_payload_is_red_and_names_the_service() {
        let payload = message_payload(&service(), &slack_config(), None, false);

        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["title"], "ALERT");
        assert_eq!(attachment["color"], "danger");
        assert_eq!(
            attachment["text"],
            "The service svc-1 has stopped sending heartbeats"
        );

        let fields = attachment["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0]["title"], "service");
        assert_eq!(fields[0]["value"], "svc-1");
        assert_eq!(fields[1]["title"], "env");
        assert_eq!(fields[1]["value"], "prod");
    }

    #[test]
    fn recovery_payload_includes_last_heartbeat_when_known() {
        let now = Utc::now();
        let payload = message_payload(&service(), &slack_config(), Some(now), true);

        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["title"], "RECOVERY");
        assert_eq!(attachment["color"], "good");

        let fields = attachment["fields"].as_array().unwrap();
        assert_eq!(fields[1]["title"], "last heartbeat");
        assert_eq!(fields[1]["value"], encode_timestamp(now));
    }
}
