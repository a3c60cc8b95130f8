use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for one watchdog node.
///
/// Loaded from a YAML (or JSON; YAML is a superset) file passed via
/// `--config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Address the HTTP frontage binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Identity of this node, used as the leader-election ballot value.
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Basic-auth credentials for the admin endpoints.
    pub username: String,
    pub password: String,

    /// How often the deadline checker ticks.
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    pub storage: StorageConfig,

    /// Services configured at boot time. With the etcd backend these are
    /// pushed into the shared store on startup.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_node_id() -> String {
    "deadman-switch".to_string()
}

fn default_check_interval() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Single-node, in-process maps. No coordination, no queue.
    Memory,
    /// Replicated KV store shared by all nodes of the cluster.
    Etcd(EtcdStorageConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdStorageConfig {
    pub endpoints: Vec<String>,

    /// Prefix under which all domain records are stored.
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
}

fn default_store_prefix() -> String {
    "/deadman-switch/store".to_string()
}

/// One monitored service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub id: String,

    /// Shared secret a ping must carry. Empty means unauthenticated pings
    /// are accepted.
    #[serde(default)]
    pub token: String,

    /// How long after the last heartbeat the service is considered overdue.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Minimum spacing between successive alert notifications.
    #[serde(default, with = "humantime_serde")]
    pub debounce: Duration,

    #[serde(default)]
    pub alert_notifications: Vec<NotificationConfig>,

    #[serde(default)]
    pub recovery_notifications: Vec<NotificationConfig>,
}

/// A declarative notification target. The tag keeps the wire format, the
/// config file format and the dispatch site in lock-step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum NotificationConfig {
    Webhook(WebhookConfig),
    Slack(SlackConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,

    #[serde(default = "default_webhook_method")]
    pub method: String,

    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackConfig {
    pub token: String,
    pub channel: String,

    /// Extra key/value pairs appended to the message attachment.
    #[serde(default)]
    pub message_fields: Vec<MessageField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageField {
    pub key: String,
    pub value: String,
}

pub fn load(path: &Path) -> Result<ServerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: ServerConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn service_config_round_trips_through_json() {
        let config = ServiceConfig {
            id: "svc-1".to_string(),
            token: "abc".to_string(),
            timeout: Duration::from_secs(30),
            debounce: Duration::from_secs(60),
            alert_notifications: vec![NotificationConfig::Webhook(WebhookConfig {
                url: "https://example.com/hook".to_string(),
                method: "POST".to_string(),
                body: "down".to_string(),
                headers: HashMap::from([(
                    "content-type".to_string(),
                    vec!["text/plain".to_string()],
                )]),
            })],
            recovery_notifications: vec![NotificationConfig::Slack(SlackConfig {
                token: "xoxb-1".to_string(),
                channel: "#ops".to_string(),
                message_fields: vec![MessageField {
                    key: "env".to_string(),
                    value: "prod".to_string(),
                }],
            })],
        };

        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: ServiceConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(config, decoded);
    }

    #[test]
    fn durations_use_humantime_strings() {
        let encoded = serde_json::json!({
            "id": "svc-1",
            "timeout": "30s",
            "debounce": "1m",
        });

        let config: ServiceConfig = serde_json::from_value(encoded).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.debounce, Duration::from_secs(60));
        assert!(config.token.is_empty());
        assert!(config.alert_notifications.is_empty());

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["timeout"], "30s");
        assert_eq!(value["debounce"], "1m");
    }

    #[test]
    fn notification_config_is_tagged_by_type() {
        let encoded = serde_json::json!({
            "type": "webhook",
            "config": { "url": "https://example.com/hook" },
        });

        let config: NotificationConfig = serde_json::from_value(encoded).unwrap();
        let NotificationConfig::Webhook(webhook) = &config else {
            panic!("expected webhook variant");
        };
        assert_eq!(webhook.url, "https://example.com/hook");
        assert_eq!(webhook.method, "POST");

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["type"], "webhook");
        assert_eq!(value["config"]["url"], "https://example.com/hook");
    }

    #[test]
    fn server_config_parses_from_yaml() {
        let raw = r#"
            listen: "127.0.0.1:8080"
            username: admin
            password: secret
            checkInterval: 5s
            storage:
              type: etcd
              config:
                endpoints: ["http://127.0.0.1:2379"]
            services:
              - id: svc-1
                timeout: 10s
        "#;

        let config: ServerConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.check_interval, Duration::from_secs(5));
        assert_eq!(config.services.len(), 1);
        let StorageConfig::Etcd(etcd) = &config.storage else {
            panic!("expected etcd storage");
        };
        assert_eq!(etcd.endpoints, vec!["http://127.0.0.1:2379".to_string()]);
        assert_eq!(etcd.prefix, "/deadman-switch/store");
    }

    #[test]
    fn memory_storage_needs_no_inner_config() {
        let raw = r#"
            username: admin
            password: secret
            storage:
              type: memory
        "#;

        let config: ServerConfig = serde_yaml::from_str(raw).unwrap();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.check_interval, Duration::from_secs(10));
    }
}
