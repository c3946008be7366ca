//! Escalation notifier: turns ledger-recorded verdicts into messages for
//! the affected parties.
//!
//! Delivery is best-effort and strictly off the verification hot path: a
//! sink failure is retried with exponential backoff, then logged and
//! dropped. A notification failure never changes or delays a verdict.
//!
//! Audience separation is a privacy boundary, not formatting. Students
//! receive remediation guidance that does not reveal which detection rule
//! fired or its measured values; instructors receive the full scores and
//! reason details; the integrity office is only engaged at Critical
//! severity.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{Decision, ReasonCode, Severity, VerdictFingerprint, VerificationVerdict};

/// Who a notification is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    /// The student whose attempt was verified.
    Student,
    /// The instructor of the session's course.
    Instructor,
    /// The academic-integrity office.
    IntegrityOffice,
}

/// A composed message ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Opaque delivery address (email, push token); owned by the sink.
    pub recipient: String,
    /// Which audience the body was composed for.
    pub audience: Audience,
    /// Routing urgency, from the verdict's severity.
    pub urgency: Severity,
    /// Subject line.
    pub subject: String,
    /// Message body.
    pub body: String,
    /// Fingerprint of the verdict this message describes.
    pub verdict_fingerprint: VerdictFingerprint,
}

/// Delivery addresses for one verdict's notifications.
#[derive(Debug, Clone)]
pub struct Recipients {
    /// The student's delivery address.
    pub student: String,
    /// The course instructor's delivery address.
    pub instructor: String,
    /// The integrity office's delivery address, if escalation is wired up.
    pub integrity_office: Option<String>,
}

/// Failure from the delivery transport.
#[derive(Debug, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct SinkError(pub String);

/// Delivery transport (email gateway, push service).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification.
    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError>;
}

/// Retry schedule for failed deliveries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 4).
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds (default: 250).
    pub base_delay_ms: u64,
    /// Cap on any single delay in milliseconds (default: 5000).
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling each time.
    fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis((self.base_delay_ms * factor).min(self.max_delay_ms))
    }
}

/// Per-verdict delivery summary.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Notifications the sink accepted.
    pub delivered: usize,
    /// Notifications dropped after exhausting retries.
    pub dropped: usize,
}

/// Composes and dispatches notifications for recorded verdicts.
pub struct EscalationNotifier {
    sink: Arc<dyn NotificationSink>,
    retry: RetryPolicy,
    notify_on_accept: bool,
}

impl EscalationNotifier {
    /// Create a notifier. Accepts are silent unless
    /// [`notify_on_accept`](Self::with_accept_notifications) is enabled.
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            retry: RetryPolicy::default(),
            notify_on_accept: false,
        }
    }

    /// Override the retry schedule.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Also send the student a confirmation on ACCEPT.
    pub fn with_accept_notifications(mut self) -> Self {
        self.notify_on_accept = true;
        self
    }

    /// Compose and dispatch every notification the verdict warrants.
    ///
    /// Best-effort: the report says what was dropped, but nothing here
    /// returns an error to the verification path.
    pub async fn notify(
        &self,
        verdict: &VerificationVerdict,
        recipients: &Recipients,
    ) -> DeliveryReport {
        let notifications = self.compose(verdict, recipients);
        let mut report = DeliveryReport::default();

        for notification in &notifications {
            if self.deliver_with_retry(notification).await {
                report.delivered += 1;
            } else {
                report.dropped += 1;
            }
        }

        report
    }

    /// Build the notification set for a verdict without sending.
    pub fn compose(
        &self,
        verdict: &VerificationVerdict,
        recipients: &Recipients,
    ) -> Vec<Notification> {
        let severity = verdict.severity();
        let mut notifications = Vec::new();

        match verdict.decision {
            Decision::Accept if !self.notify_on_accept => {}
            Decision::Accept => notifications.push(Notification {
                recipient: recipients.student.clone(),
                audience: Audience::Student,
                urgency: severity,
                subject: "Attendance recorded".to_string(),
                body: "Your check-in was verified and attendance has been recorded.".to_string(),
                verdict_fingerprint: verdict.fingerprint.clone(),
            }),
            Decision::Flag | Decision::Reject => {
                notifications.push(Notification {
                    recipient: recipients.student.clone(),
                    audience: Audience::Student,
                    urgency: severity,
                    subject: match verdict.decision {
                        Decision::Reject => "Check-in could not be verified".to_string(),
                        _ => "Check-in under review".to_string(),
                    },
                    body: student_body(verdict),
                    verdict_fingerprint: verdict.fingerprint.clone(),
                });
                notifications.push(Notification {
                    recipient: recipients.instructor.clone(),
                    audience: Audience::Instructor,
                    urgency: severity,
                    subject: format!(
                        "[{}] Check-in {} for review",
                        severity, verdict.decision
                    ),
                    body: instructor_body(verdict),
                    verdict_fingerprint: verdict.fingerprint.clone(),
                });
            }
        }

        if severity == Severity::Critical {
            if let Some(office) = &recipients.integrity_office {
                notifications.push(Notification {
                    recipient: office.clone(),
                    audience: Audience::IntegrityOffice,
                    urgency: severity,
                    subject: "[CRITICAL] Attendance integrity escalation".to_string(),
                    body: instructor_body(verdict),
                    verdict_fingerprint: verdict.fingerprint.clone(),
                });
            }
        }

        notifications
    }

    async fn deliver_with_retry(&self, notification: &Notification) -> bool {
        for attempt in 1..=self.retry.max_attempts {
            match self.sink.deliver(notification).await {
                Ok(()) => {
                    tracing::debug!(
                        audience = ?notification.audience,
                        urgency = %notification.urgency,
                        attempt,
                        "notification delivered"
                    );
                    return true;
                }
                Err(err) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        audience = ?notification.audience,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "notification delivery failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::error!(
                        audience = ?notification.audience,
                        attempts = self.retry.max_attempts,
                        fingerprint = %notification.verdict_fingerprint,
                        error = %err,
                        "notification dropped after exhausting retries"
                    );
                }
            }
        }
        false
    }
}

/// Student-facing body: remediation steps, never rule internals.
fn student_body(verdict: &VerificationVerdict) -> String {
    let mut steps: Vec<&str> = Vec::new();
    for reason in &verdict.reasons {
        let step = match reason.code {
            ReasonCode::OutsideGeofence { .. }
            | ReasonCode::LowAccuracy { .. }
            | ReasonCode::MissingLocation => {
                "confirm location services are enabled and check in from inside the classroom"
            }
            ReasonCode::DeviceShared { .. }
            | ReasonCode::DeviceFarm { .. }
            | ReasonCode::NewDevice
            | ReasonCode::MissingFingerprint => {
                "check in from your own registered device"
            }
            ReasonCode::PhotoLowConfidence { .. } | ReasonCode::MissingPhoto => {
                "retake the verification photo in good lighting"
            }
            ReasonCode::ImplausibleArrival { .. } | ReasonCode::RapidAttempts { .. } => {
                "wait for the instructor to display the current code and check in once"
            }
            ReasonCode::ChannelDegraded { .. } => continue,
        };
        if !steps.contains(&step) {
            steps.push(step);
        }
    }

    let mut body = match verdict.decision {
        Decision::Reject => {
            "Your check-in could not be verified and attendance was not recorded.".to_string()
        }
        _ => "Your check-in was recorded provisionally and is under review.".to_string(),
    };
    if !steps.is_empty() {
        body.push_str("\n\nTo resolve this:");
        for step in steps {
            body.push_str("\n- ");
            body.push_str(step);
        }
    }
    if verdict.decision == Decision::Reject {
        body.push_str(&format!(
            "\n\nIf you believe this is an error, contact your instructor and quote appeal reference {}.",
            verdict.fingerprint
        ));
    }
    body
}

/// Instructor-facing body: the full picture.
fn instructor_body(verdict: &VerificationVerdict) -> String {
    let mut body = format!(
        "Decision: {}\nOverall risk: {:.1}/100\nStudent: {}\nSession: {}\n\nChannel scores:",
        verdict.decision, verdict.overall_risk, verdict.student_id, verdict.session_id
    );
    for (channel, score) in &verdict.channel_scores {
        body.push_str(&format!("\n- {channel}: {score:.1}"));
    }
    if verdict.reasons.is_empty() {
        body.push_str("\n\nNo rules triggered.");
    } else {
        body.push_str("\n\nTriggered rules:");
        for reason in &verdict.reasons {
            body.push_str(&format!("\n- [{}] {}", reason.severity, reason.detail));
        }
    }
    body.push_str(&format!("\n\nVerdict reference: {}", verdict.fingerprint));
    body
}
