use crate::config::{EmailConfig, NotificationConfig, SlackConfig, TestingConfig, WebhookConfig};
use crate::database::{DeliveryLog, StoreLocation};
use crate::models::{Alert, Severity};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A delivery target for alerts
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<()>;

    /// Check the destination answers, without delivering anything
    async fn test_connection(&self) -> Result<bool>;
}

pub fn severity_emoji(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "🚨",
        Severity::High => "⚠️",
        Severity::Medium => "🔶",
        Severity::Low => "ℹ️",
    }
}

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "#d00000",
        Severity::High => "#ff8c00",
        Severity::Medium => "#ffd700",
        Severity::Low => "#36a64f",
    }
}

/// One-line rendering shared by every channel
pub fn alert_text(alert: &Alert) -> String {
    format!(
        "{} [{}] {}: {}",
        severity_emoji(alert.severity),
        alert.severity.as_str().to_uppercase(),
        alert.alert_type,
        alert.message
    )
}

/// Any HTTP answer below 500 counts as reachable
async fn check_reachable(client: &reqwest::Client, url: &str) -> Result<bool> {
    let response = client.head(url).send().await.context("Connection check failed")?;
    Ok(!response.status().is_server_error())
}

/// Email through an HTTP mail relay that accepts JSON messages
pub struct EmailChannel {
    client: reqwest::Client,
    relay_url: String,
    env_var_api_key: Option<String>,
    from: String,
    recipients: Vec<String>,
}

impl EmailChannel {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let Some(relay_url) = config.relay_url.clone() else {
            bail!("Email notifications are enabled but no relay_url is set");
        };
        if config.recipients.is_empty() {
            bail!("Email notifications are enabled but no recipients are set");
        }

        Ok(Self {
            client: reqwest::Client::new(),
            relay_url,
            env_var_api_key: config.env_var_api_key.clone(),
            from: config.from.clone(),
            recipients: config.recipients.clone(),
        })
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let subject = format!(
            "[{}] calendar-eval alert: {}",
            alert.severity.as_str().to_uppercase(),
            alert.alert_type
        );
        let body = format!(
            "{}\n\nSeverity: {}\nFirst seen: {}\nKey: {}",
            alert.message, alert.severity, alert.first_seen, alert.key
        );

        let mut request = self.client.post(&self.relay_url).json(&json!({
            "from": self.from,
            "to": self.recipients,
            "subject": subject,
            "text": body,
        }));
        if let Some(env_var) = &self.env_var_api_key {
            let api_key =
                std::env::var(env_var).with_context(|| format!("Environment variable {} not found", env_var))?;
            request = request.bearer_auth(api_key);
        }

        request
            .send()
            .await
            .context("Mail relay request failed")?
            .error_for_status()
            .context("Mail relay rejected the message")?;
        Ok(())
    }

    async fn test_connection(&self) -> Result<bool> {
        check_reachable(&self.client, &self.relay_url).await
    }
}

/// Slack incoming webhook
pub struct SlackChannel {
    client: reqwest::Client,
    webhook_url: String,
    channel: Option<String>,
}

impl SlackChannel {
    pub fn new(config: &SlackConfig) -> Result<Self> {
        let Some(webhook_url) = config.webhook_url.clone() else {
            bail!("Slack notifications are enabled but no webhook_url is set");
        };

        Ok(Self {
            client: reqwest::Client::new(),
            webhook_url,
            channel: config.channel.clone(),
        })
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let mut payload = json!({
            "text": alert_text(alert),
            "attachments": [{
                "color": severity_color(alert.severity),
                "title": alert.alert_type,
                "text": alert.message,
                "fields": [
                    { "title": "Severity", "value": alert.severity.as_str(), "short": true },
                    { "title": "First seen", "value": alert.first_seen, "short": true },
                ],
            }],
        });
        if let Some(channel) = &self.channel {
            payload["channel"] = json!(channel);
        }

        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("Slack request failed")?
            .error_for_status()
            .context("Slack rejected the message")?;
        Ok(())
    }

    async fn test_connection(&self) -> Result<bool> {
        check_reachable(&self.client, &self.webhook_url).await
    }
}

/// Generic webhook receiving the alert as JSON
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl WebhookChannel {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let Some(url) = config.url.clone() else {
            bail!("Webhook notifications are enabled but no url is set");
        };

        Ok(Self {
            client: reqwest::Client::new(),
            url,
            headers: config.headers.clone(),
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let mut request = self.client.post(&self.url).json(alert);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        request
            .send()
            .await
            .context("Webhook request failed")?
            .error_for_status()
            .context("Webhook rejected the alert")?;
        Ok(())
    }

    async fn test_connection(&self) -> Result<bool> {
        check_reachable(&self.client, &self.url).await
    }
}

/// Build every enabled channel. An enabled channel without a destination is an error.
pub fn build_channels(config: &NotificationConfig) -> Result<Vec<Box<dyn NotificationChannel>>> {
    let mut channels: Vec<Box<dyn NotificationChannel>> = Vec::new();
    if config.email.enabled {
        channels.push(Box::new(EmailChannel::new(&config.email)?));
    }
    if config.slack.enabled {
        channels.push(Box::new(SlackChannel::new(&config.slack)?));
    }
    if config.webhook.enabled {
        channels.push(Box::new(WebhookChannel::new(&config.webhook)?));
    }
    Ok(channels)
}

/// Fans alerts out to every channel, with per-channel timeouts and per-key
/// debouncing against a persistent delivery log
pub struct NotificationManager {
    channels: Vec<Box<dyn NotificationChannel>>,
    timeout: Duration,
    debounce_window: Duration,
    deliveries: DeliveryLog,
}

impl NotificationManager {
    pub fn new(
        channels: Vec<Box<dyn NotificationChannel>>,
        timeout: Duration,
        debounce_window: Duration,
        deliveries: DeliveryLog,
    ) -> Self {
        Self {
            channels,
            timeout,
            debounce_window,
            deliveries,
        }
    }

    /// Delivery history is kept in the results store
    pub fn from_config(config: &TestingConfig) -> Result<Self> {
        let channels = build_channels(&config.notifications).context("Invalid notification config")?;
        let deliveries = DeliveryLog::open(&StoreLocation::parse(&config.results_storage))
            .with_context(|| format!("Failed to open delivery log in {}", config.results_storage))?;
        Ok(Self::new(channels, config.notifications.timeout(), config.debounce_window(), deliveries))
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn has_channels(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Deliver on every channel. Returns per-channel success; an empty map
    /// means the alert was suppressed by the debounce window.
    pub async fn send_notification(&self, alert: &Alert) -> BTreeMap<String, bool> {
        self.send_notification_at(alert, Utc::now()).await
    }

    pub async fn send_notification_at(&self, alert: &Alert, now: DateTime<Utc>) -> BTreeMap<String, bool> {
        if self.is_debounced(&alert.key, now) {
            debug!(key = %alert.key, "Alert suppressed by debounce window");
            return BTreeMap::new();
        }

        let deliveries = self.channels.iter().map(|channel| async move {
            let delivered = match tokio::time::timeout(self.timeout, channel.send(alert)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(channel = channel.name(), key = %alert.key, error = %e, "Notification delivery failed");
                    false
                }
                Err(_) => {
                    warn!(channel = channel.name(), key = %alert.key, timeout = ?self.timeout, "Notification delivery timed out");
                    false
                }
            };
            (channel.name().to_string(), delivered)
        });
        let outcomes: BTreeMap<String, bool> = join_all(deliveries).await.into_iter().collect();

        if outcomes.values().any(|delivered| *delivered) {
            if let Err(e) = self.deliveries.record_delivery(&alert.key, now) {
                warn!(key = %alert.key, error = %e, "Failed to record alert delivery");
            }
            info!(key = %alert.key, severity = %alert.severity, "Alert delivered");
        }

        outcomes
    }

    /// An unreadable delivery log never blocks an alert
    fn is_debounced(&self, key: &str, now: DateTime<Utc>) -> bool {
        match self.deliveries.last_delivery(key) {
            // A send stamped in the future counts as inside the window
            Ok(Some(last)) => (now - last)
                .to_std()
                .map(|elapsed| elapsed < self.debounce_window)
                .unwrap_or(true),
            Ok(None) => false,
            Err(e) => {
                warn!(key, error = %e, "Failed to read alert delivery log");
                false
            }
        }
    }

    /// Check every channel concurrently
    pub async fn test_connections(&self) -> BTreeMap<String, bool> {
        let checks = self.channels.iter().map(|channel| async move {
            let reachable = match tokio::time::timeout(self.timeout, channel.test_connection()).await {
                Ok(Ok(reachable)) => reachable,
                Ok(Err(e)) => {
                    warn!(channel = channel.name(), error = %e, "Connection test failed");
                    false
                }
                Err(_) => {
                    warn!(channel = channel.name(), "Connection test timed out");
                    false
                }
            };
            (channel.name().to_string(), reachable)
        });
        join_all(checks).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Succeed,
        Fail,
        Hang,
    }

    struct MockChannel {
        name: String,
        behavior: Behavior,
        sent: Arc<AtomicUsize>,
    }

    impl MockChannel {
        fn boxed(name: &str, behavior: Behavior) -> (Box<dyn NotificationChannel>, Arc<AtomicUsize>) {
            let sent = Arc::new(AtomicUsize::new(0));
            let channel = MockChannel { name: name.to_string(), behavior, sent: sent.clone() };
            (Box::new(channel), sent)
        }
    }

    #[async_trait]
    impl NotificationChannel for MockChannel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, _alert: &Alert) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => bail!("{} is down", self.name),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            }
        }

        async fn test_connection(&self) -> Result<bool> {
            match self.behavior {
                Behavior::Succeed => Ok(true),
                Behavior::Fail => bail!("{} unreachable", self.name),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(true)
                }
            }
        }
    }

    fn alert(key: &str) -> Alert {
        Alert {
            severity: Severity::High,
            alert_type: "regression".to_string(),
            message: "Clarity dropped 20%".to_string(),
            first_seen: "2026-03-10T12:00:00.000Z".to_string(),
            key: key.to_string(),
        }
    }

    fn manager(channels: Vec<Box<dyn NotificationChannel>>) -> NotificationManager {
        NotificationManager::new(
            channels,
            Duration::from_millis(200),
            Duration::from_secs(3600),
            DeliveryLog::in_memory().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_one_failing_channel_is_isolated() {
        let (email, _) = MockChannel::boxed("email", Behavior::Succeed);
        let (slack, _) = MockChannel::boxed("slack", Behavior::Fail);
        let (webhook, _) = MockChannel::boxed("webhook", Behavior::Succeed);
        let manager = manager(vec![email, slack, webhook]);

        let outcomes = manager.send_notification(&alert("regression.clarity")).await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes.values().filter(|ok| !**ok).count(), 1);
        assert!(!outcomes["slack"]);
        assert!(outcomes["email"]);
        assert!(outcomes["webhook"]);
    }

    #[tokio::test]
    async fn test_hanging_channel_times_out() {
        let (email, _) = MockChannel::boxed("email", Behavior::Succeed);
        let (slack, _) = MockChannel::boxed("slack", Behavior::Hang);
        let manager = manager(vec![email, slack]);

        let start = std::time::Instant::now();
        let outcomes = manager.send_notification(&alert("k")).await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(outcomes["email"]);
        assert!(!outcomes["slack"]);
    }

    #[tokio::test]
    async fn test_repeated_key_is_debounced() {
        let (email, sent) = MockChannel::boxed("email", Behavior::Succeed);
        let manager = manager(vec![email]);
        let now = Utc::now();

        assert_eq!(manager.send_notification_at(&alert("k"), now).await.len(), 1);
        assert!(manager.send_notification_at(&alert("k"), now + chrono::Duration::minutes(5)).await.is_empty());
        assert_eq!(manager.send_notification_at(&alert("other"), now).await.len(), 1);
        assert_eq!(
            manager.send_notification_at(&alert("k"), now + chrono::Duration::hours(2)).await.len(),
            1
        );
        assert_eq!(sent.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_debounce_holds_across_managers_sharing_a_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let location = StoreLocation::Path(dir.path().join("results.db"));
        let now = Utc::now();

        let (email, first_sent) = MockChannel::boxed("email", Behavior::Succeed);
        let first_run = NotificationManager::new(
            vec![email],
            Duration::from_millis(200),
            Duration::from_secs(3600),
            DeliveryLog::open(&location).unwrap(),
        );
        assert_eq!(first_run.send_notification_at(&alert("regression.clarity"), now).await.len(), 1);
        drop(first_run);

        let (email, second_sent) = MockChannel::boxed("email", Behavior::Succeed);
        let second_run = NotificationManager::new(
            vec![email],
            Duration::from_millis(200),
            Duration::from_secs(3600),
            DeliveryLog::open(&location).unwrap(),
        );
        let five_minutes_later = now + chrono::Duration::minutes(5);
        assert!(
            second_run
                .send_notification_at(&alert("regression.clarity"), five_minutes_later)
                .await
                .is_empty()
        );
        assert_eq!(
            second_run
                .send_notification_at(&alert("regression.clarity"), now + chrono::Duration::hours(2))
                .await
                .len(),
            1
        );

        assert_eq!(first_sent.load(Ordering::SeqCst), 1);
        assert_eq!(second_sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_not_debounced() {
        let (slack, sent) = MockChannel::boxed("slack", Behavior::Fail);
        let manager = manager(vec![slack]);

        manager.send_notification(&alert("k")).await;
        let retry = manager.send_notification(&alert("k")).await;
        assert!(!retry["slack"]);
        assert_eq!(sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connections_do_not_send() {
        let (email, sent) = MockChannel::boxed("email", Behavior::Succeed);
        let (slack, _) = MockChannel::boxed("slack", Behavior::Fail);
        let manager = manager(vec![email, slack]);

        let reachability = manager.test_connections().await;
        assert!(reachability["email"]);
        assert!(!reachability["slack"]);
        assert_eq!(sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_enabled_channel_without_destination_is_rejected() {
        let mut config = NotificationConfig::default();
        assert!(build_channels(&config).unwrap().is_empty());

        config.slack.enabled = true;
        assert!(build_channels(&config).is_err());

        config.slack.webhook_url = Some("http://localhost/hook".to_string());
        config.email.enabled = true;
        config.email.relay_url = Some("http://localhost/mail".to_string());
        assert!(build_channels(&config).is_err());

        config.email.recipients = vec!["oncall@example.com".to_string()];
        let names: Vec<String> = build_channels(&config).unwrap().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["email".to_string(), "slack".to_string()]);
    }

    #[test]
    fn test_alert_text() {
        let text = alert_text(&alert("k"));
        assert!(text.starts_with("⚠️ [HIGH] regression"));
        assert!(text.ends_with("Clarity dropped 20%"));
    }

    #[tokio::test]
    async fn test_slack_channel_posts_attachment() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::PartialJson(json!({ "channel": "#calendar-alerts" })),
                mockito::Matcher::Regex("#ff8c00".to_string()),
            ]))
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let channel = SlackChannel::new(&SlackConfig {
            enabled: true,
            webhook_url: Some(format!("{}/hook", server.url())),
            channel: Some("#calendar-alerts".to_string()),
        })
        .unwrap();

        channel.send(&alert("k")).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_channel_sends_headers_and_alert() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/alerts")
            .match_header("x-team", "calendar")
            .match_body(mockito::Matcher::PartialJson(json!({ "type": "regression", "key": "k" })))
            .with_status(204)
            .create_async()
            .await;

        let mut headers = BTreeMap::new();
        headers.insert("x-team".to_string(), "calendar".to_string());
        let channel = WebhookChannel::new(&WebhookConfig {
            enabled: true,
            url: Some(format!("{}/alerts", server.url())),
            headers,
        })
        .unwrap();

        channel.send(&alert("k")).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_email_channel_uses_relay() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .match_header("authorization", "Bearer relay-key")
            .match_body(mockito::Matcher::PartialJson(json!({
                "to": ["oncall@example.com"],
                "subject": "[HIGH] calendar-eval alert: regression"
            })))
            .with_status(202)
            .create_async()
            .await;

        let env_var = "CALENDAR_EVAL_TEST_RELAY_KEY";
        unsafe {
            std::env::set_var(env_var, "relay-key");
        }
        let channel = EmailChannel::new(&EmailConfig {
            enabled: true,
            relay_url: Some(format!("{}/send", server.url())),
            env_var_api_key: Some(env_var.to_string()),
            recipients: vec!["oncall@example.com".to_string()],
            ..EmailConfig::default()
        })
        .unwrap();

        channel.send(&alert("k")).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_delivery_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/hook").with_status(500).create_async().await;

        let channel = SlackChannel::new(&SlackConfig {
            enabled: true,
            webhook_url: Some(format!("{}/hook", server.url())),
            channel: None,
        })
        .unwrap();
        assert!(channel.send(&alert("k")).await.is_err());
    }

    #[tokio::test]
    async fn test_reachability_check() {
        let mut server = mockito::Server::new_async().await;
        let _ok = server.mock("HEAD", "/hook").with_status(200).create_async().await;
        let _down = server.mock("HEAD", "/broken").with_status(503).create_async().await;

        let reachable = WebhookChannel::new(&WebhookConfig {
            enabled: true,
            url: Some(format!("{}/hook", server.url())),
            headers: BTreeMap::new(),
        })
        .unwrap();
        let broken = WebhookChannel::new(&WebhookConfig {
            enabled: true,
            url: Some(format!("{}/broken", server.url())),
            headers: BTreeMap::new(),
        })
        .unwrap();

        assert!(reachable.test_connection().await.unwrap());
        assert!(!broken.test_connection().await.unwrap());
    }
}
