//! Notifications
//!
//! The engine builds complete messages; delivery is a collaborator concern.
//! Stakeholders get an email per failed file according to the source's
//! notification policy (with a webhook fallback when no mailer is wired).
//! Internal faults and the end-of-run summary go to the webhook. Webhook
//! payloads never contain row data.

pub mod email;
pub mod webhook;

use crate::pipeline::LoadCounts;
use crate::sources::SourceConfig;
use async_trait::async_trait;
use fileloader_common::{Audience, LoadError, LoadResult};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

pub use webhook::{WebhookClient, WebhookPayload};

/// A fully built email, ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

/// Message delivery capability (SMTP or otherwise).
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> LoadResult<()>;
}

/// Directory and addressing context woven into message bodies.
#[derive(Debug, Clone, Default)]
pub struct NotifyContext {
    pub archive_path: String,
    pub duplicate_files_path: String,
    /// Always CC'd on failure notifications.
    pub data_team_email: Option<String>,
}

/// Fan-out point for all notifications.
pub struct NotifyHub {
    mailer: Option<Arc<dyn Mailer>>,
    webhook: Option<WebhookClient>,
    context: NotifyContext,
}

impl NotifyHub {
    pub fn new(
        mailer: Option<Arc<dyn Mailer>>,
        webhook: Option<WebhookClient>,
        context: NotifyContext,
    ) -> Self {
        Self {
            mailer,
            webhook,
            context,
        }
    }

    /// Hub that only logs; used by tests and bare local runs.
    pub fn disabled() -> Self {
        Self::new(None, None, NotifyContext::default())
    }

    /// Notify about a terminally failed file per the error's audience.
    /// Never returns an error: notification failures must not mask the
    /// pipeline's terminal state.
    pub async fn file_failure(
        &self,
        source: &SourceConfig,
        filename: &str,
        file_load_id: Option<i64>,
        err: &LoadError,
        counts: LoadCounts,
        dlq_reasons: &[String],
    ) {
        match err.audience() {
            Audience::None => {},
            Audience::Stakeholder => {
                let mut emailed = false;
                if source.notify.enabled_for(err.kind()) {
                    let message = email::build_failure_email(
                        source,
                        filename,
                        err,
                        counts,
                        dlq_reasons,
                        &self.context,
                    );
                    if let Some(ref mailer) = self.mailer {
                        match mailer.send(&message).await {
                            Ok(()) => {
                                info!(filename, kind = %err.kind(), "Stakeholder email sent");
                                emailed = true;
                            },
                            Err(e) => {
                                error!(filename, error = %e, "Failed to send stakeholder email");
                            },
                        }
                    }
                }
                if !emailed {
                    self.post_webhook(WebhookPayload::file_error(
                        source.name.as_str(),
                        filename,
                        file_load_id,
                        err,
                    ))
                    .await;
                }
            },
            Audience::Internal => {
                self.post_webhook(WebhookPayload::file_error(
                    source.name.as_str(),
                    filename,
                    file_load_id,
                    err,
                ))
                .await;
            },
        }
    }

    /// Internal fault outside any single source (listing failures, worker
    /// panics, cleanup errors).
    pub async fn internal(&self, event: &str, filename: Option<&str>, detail: &str) {
        self.post_webhook(WebhookPayload::internal(event, filename, detail))
            .await;
    }

    /// End-of-run summary; webhooked when anything failed.
    pub async fn run_summary(
        &self,
        succeeded: usize,
        failed: usize,
        unmatched: usize,
        details: &[String],
    ) {
        info!(succeeded, failed, unmatched, "Run complete");
        if failed > 0 || unmatched > 0 {
            self.post_webhook(WebhookPayload::summary(succeeded, failed, unmatched, details))
                .await;
        }
    }

    async fn post_webhook(&self, payload: WebhookPayload) {
        if let Some(ref webhook) = self.webhook {
            if let Err(e) = webhook.send(&payload).await {
                warn!(error = %e, "Webhook delivery failed");
            }
        } else {
            warn!(event = %payload.event, "No webhook configured; dropping internal notification");
        }
    }
}

/// Mailer that records messages instead of sending them. Used by the test
/// suite and by dry runs without SMTP settings.
#[derive(Default)]
pub struct RecordingMailer {
    messages: Mutex<Vec<EmailMessage>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<EmailMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> LoadResult<()> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        Ok(())
    }
}
