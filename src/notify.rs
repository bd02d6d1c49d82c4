//! Notification side-channel.
//!
//! Notifications are best-effort: [`Notifications`] logs and swallows every
//! delivery failure so the pipeline never blocks on them.
//!
//! | Kind | Wire code | Process name |
//! |------|-----------|--------------|
//! | `Start` | `INFO_START_PROCESS` | `{project}` |
//! | `DocumentError` | `ERROR_FINALLY_PROCESS` | `{project} \| {document}` |
//! | `AggregationSuccess` | `SUCCESS_FINALLY_PROCESS` | `{project} \| CSV generated` |
//! | `AggregationError` | `ERROR_FINALLY_PROCESS` | `{project} \| CSV error` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::NotificationsConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Start,
    DocumentError,
    AggregationSuccess,
    AggregationError,
}

impl NotificationKind {
    pub fn code(&self) -> &'static str {
        match self {
            NotificationKind::Start => "INFO_START_PROCESS",
            NotificationKind::DocumentError | NotificationKind::AggregationError => {
                "ERROR_FINALLY_PROCESS"
            }
            NotificationKind::AggregationSuccess => "SUCCESS_FINALLY_PROCESS",
        }
    }
}

/// One `{label, value}` pair of template data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub label: String,
    pub value: String,
}

impl Metadata {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub process_name: String,
    pub metadata: Vec<Metadata>,
}

impl Notification {
    pub fn start(project_id: &str) -> Self {
        Self {
            kind: NotificationKind::Start,
            process_name: project_id.to_string(),
            metadata: Vec::new(),
        }
    }

    pub fn document_error(project_id: &str, document: &str, error: &str) -> Self {
        Self {
            kind: NotificationKind::DocumentError,
            process_name: format!("{} | {}", project_id, document),
            metadata: vec![Metadata::new("{{error}}", error)],
        }
    }

    pub fn aggregation_success(project_id: &str) -> Self {
        Self {
            kind: NotificationKind::AggregationSuccess,
            process_name: format!("{} | CSV generated", project_id),
            metadata: Vec::new(),
        }
    }

    pub fn aggregation_error(project_id: &str, error: &str) -> Self {
        Self {
            kind: NotificationKind::AggregationError,
            process_name: format!("{} | CSV error", project_id),
            metadata: vec![Metadata::new("{{error}}", error)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Accepted, with the HTTP status of the notification service.
    Delivered(u16),
    Rejected(u16),
}

impl DeliveryStatus {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered(_))
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<DeliveryStatus>;
}

// ============ HTTP notifier ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmailNotificationBody<'a> {
    id_project: &'a str,
    type_notification: &'static str,
    notification: &'static str,
    data: Vec<Metadata>,
}

pub struct HttpNotifier {
    url: String,
    project_tag: String,
    reference_folder: String,
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(
        base_url: &str,
        project_tag: &str,
        reference_folder: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build notification client: {}", e)))?;
        Ok(Self {
            url: format!("{}/email-notification", base_url.trim_end_matches('/')),
            project_tag: project_tag.to_string(),
            reference_folder: reference_folder.to_string(),
            client,
        })
    }

    /// `None` when no base URL is configured.
    pub fn from_config(config: &NotificationsConfig) -> Result<Option<Self>> {
        match config.base_url.as_deref().map(str::trim) {
            Some(base) if !base.is_empty() => Ok(Some(Self::new(
                base,
                &config.project_tag,
                &config.reference_folder,
                Duration::from_secs(config.timeout_secs),
            )?)),
            _ => Ok(None),
        }
    }

    fn body<'a>(&'a self, notification: &Notification) -> EmailNotificationBody<'a> {
        let mut data = vec![
            Metadata::new("{{processName}}", notification.process_name.clone()),
            Metadata::new(
                "{{id}}",
                format!("{}|{}", self.reference_folder, notification.process_name),
            ),
        ];
        data.extend(notification.metadata.iter().cloned());
        EmailNotificationBody {
            id_project: &self.project_tag,
            type_notification: "EMAIL",
            notification: notification.kind.code(),
            data,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, notification: &Notification) -> Result<DeliveryStatus> {
        let resp = self
            .client
            .post(&self.url)
            .json(&self.body(notification))
            .send()
            .await
            .map_err(|e| Error::ExternalService(format!("notification request failed: {}", e)))?;
        let status = resp.status().as_u16();
        if status >= 400 {
            Ok(DeliveryStatus::Rejected(status))
        } else {
            Ok(DeliveryStatus::Delivered(status))
        }
    }
}

// ============ Best-effort wrapper ============

/// Optional notifier that never fails the caller.
#[derive(Clone, Default)]
pub struct Notifications {
    notifier: Option<Arc<dyn Notifier>>,
}

impl Notifications {
    pub fn new(notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self { notifier }
    }

    pub fn disabled() -> Self {
        Self { notifier: None }
    }

    pub fn from_config(config: &NotificationsConfig) -> Result<Self> {
        let notifier = HttpNotifier::from_config(config)?
            .map(|n| Arc::new(n) as Arc<dyn Notifier>);
        if notifier.is_none() {
            tracing::info!("NOTIFICATIONS_BASE_URL not set, notifications disabled");
        }
        Ok(Self { notifier })
    }

    pub fn is_enabled(&self) -> bool {
        self.notifier.is_some()
    }

    /// Send and report whether the notification was delivered. Failures are
    /// logged; `false` when disabled.
    pub async fn send(&self, notification: Notification) -> bool {
        let Some(notifier) = &self.notifier else {
            tracing::debug!(process = %notification.process_name, "notifications disabled");
            return false;
        };
        match notifier.send(&notification).await {
            Ok(DeliveryStatus::Delivered(status)) => {
                tracing::info!(
                    code = notification.kind.code(),
                    process = %notification.process_name,
                    status,
                    "notification sent"
                );
                true
            }
            Ok(DeliveryStatus::Rejected(status)) => {
                tracing::warn!(
                    code = notification.kind.code(),
                    process = %notification.process_name,
                    status,
                    "notification rejected"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    code = notification.kind.code(),
                    process = %notification.process_name,
                    error = %e,
                    "notification failed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        sent: Mutex<Vec<Notification>>,
        status: Result<DeliveryStatus>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn send(&self, notification: &Notification) -> Result<DeliveryStatus> {
            self.sent.lock().unwrap().push(notification.clone());
            match &self.status {
                Ok(s) => Ok(*s),
                Err(e) => Err(Error::ExternalService(e.to_string())),
            }
        }
    }

    #[test]
    fn test_process_names() {
        assert_eq!(Notification::start("P1").process_name, "P1");
        assert_eq!(
            Notification::document_error("P1", "a.pdf", "boom").process_name,
            "P1 | a.pdf"
        );
        assert_eq!(
            Notification::aggregation_success("P1").process_name,
            "P1 | CSV generated"
        );
        let err = Notification::aggregation_error("P1", "HTTP 500");
        assert_eq!(err.process_name, "P1 | CSV error");
        assert_eq!(err.metadata, vec![Metadata::new("{{error}}", "HTTP 500")]);
        assert_eq!(err.kind.code(), "ERROR_FINALLY_PROCESS");
    }

    #[test]
    fn test_http_body_shape() {
        let notifier =
            HttpNotifier::new("http://x/api/", "TAG", "ref", Duration::from_secs(1)).unwrap();
        assert_eq!(notifier.url, "http://x/api/email-notification");
        let body = serde_json::to_value(
            notifier.body(&Notification::document_error("P1", "a.pdf", "boom")),
        )
        .unwrap();
        assert_eq!(body["idProject"], "TAG");
        assert_eq!(body["typeNotification"], "EMAIL");
        assert_eq!(body["notification"], "ERROR_FINALLY_PROCESS");
        assert_eq!(body["data"][0]["label"], "{{processName}}");
        assert_eq!(body["data"][0]["value"], "P1 | a.pdf");
        assert_eq!(body["data"][1]["value"], "ref|P1 | a.pdf");
        assert_eq!(body["data"][2]["label"], "{{error}}");
    }

    #[tokio::test]
    async fn test_wrapper_swallows_failures() {
        let failing = Arc::new(Recording {
            sent: Mutex::new(Vec::new()),
            status: Err(Error::ExternalService("down".into())),
        });
        let n = Notifications::new(Some(failing.clone()));
        assert!(!n.send(Notification::start("P1")).await);
        assert_eq!(failing.sent.lock().unwrap().len(), 1);

        let rejecting = Arc::new(Recording {
            sent: Mutex::new(Vec::new()),
            status: Ok(DeliveryStatus::Rejected(500)),
        });
        assert!(!Notifications::new(Some(rejecting)).send(Notification::start("P1")).await);
    }

    #[tokio::test]
    async fn test_disabled_wrapper() {
        let n = Notifications::disabled();
        assert!(!n.is_enabled());
        assert!(!n.send(Notification::start("P1")).await);
    }
}
