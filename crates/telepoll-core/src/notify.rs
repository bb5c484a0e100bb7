//! Outbox-based notification port.
//!
//! Notifications, reports and uploads are spooled as files in an outbox
//! directory for an external mailer/uploader to deliver:
//!
//! - `notifications.jsonl`: one JSON object per state change
//! - `<attachment>` + `<attachment>.json`: a report and its envelope
//! - `upload-<millis>.csv` + `upload-<millis>.json`: an upload and its envelope

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::device::Credentials;
use crate::ports::NotificationPort;
use crate::report::{self, HttpVerb, ReportFormat, Table};
use crate::sensor::{NotificationState, Sensor};

/// Default subject line for notifications.
pub const DEFAULT_SUBJECT_TEMPLATE: &str = "[{state}] {device}/{sensor} = {value}";

const NOTIFICATIONS_FILE: &str = "notifications.jsonl";

/// Expands `{sensor}`, `{device}`, `{state}`, `{value}` and `{timestamp}`.
pub fn render_template(
    template: &str,
    sensor: &Sensor,
    state: NotificationState,
    timestamp: DateTime<Utc>,
    value: f64,
) -> String {
    let device = sensor
        .device()
        .map(|d| d.name().to_string())
        .unwrap_or_default();
    template
        .replace("{sensor}", sensor.name())
        .replace("{device}", &device)
        .replace("{state}", &state.to_string())
        .replace("{value}", &value.to_string())
        .replace("{timestamp}", &timestamp.to_rfc3339())
}

/// Keeps only the final path component of a caller-supplied file name.
fn sanitize_filename(name: &str, format: ReportFormat) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("report.{}", format.extension()))
}

/// Notification port that spools everything into a directory.
#[derive(Debug)]
pub struct OutboxNotifier {
    outbox: PathBuf,
    subject_template: String,
    /// Serialises appends to the notification spool.
    spool: Mutex<()>,
}

impl OutboxNotifier {
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
            subject_template: DEFAULT_SUBJECT_TEMPLATE.to_string(),
            spool: Mutex::new(()),
        }
    }

    pub fn with_subject_template(mut self, template: impl Into<String>) -> Self {
        self.subject_template = template.into();
        self
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    fn append_notification(&self, line: &serde_json::Value) -> io::Result<()> {
        std::fs::create_dir_all(&self.outbox)?;
        let _guard = self.spool.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.outbox.join(NOTIFICATIONS_FILE))?;
        writeln!(file, "{}", line)
    }

    fn write_pair(&self, payload_name: &str, payload: Option<&[u8]>, envelope: &serde_json::Value) -> io::Result<()> {
        std::fs::create_dir_all(&self.outbox)?;
        if let Some(bytes) = payload {
            std::fs::write(self.outbox.join(payload_name), bytes)?;
        }
        let envelope = serde_json::to_vec_pretty(envelope).map_err(io::Error::other)?;
        std::fs::write(self.outbox.join(format!("{}.json", payload_name)), envelope)
    }
}

impl NotificationPort for OutboxNotifier {
    fn evaluate(&self, sensor: &Sensor, _timestamp: DateTime<Utc>, value: f64) -> NotificationState {
        sensor.thresholds().evaluate(value)
    }

    fn notify(
        &self,
        sensor: &Sensor,
        state: NotificationState,
        timestamp: DateTime<Utc>,
        value: f64,
        message: &str,
    ) {
        let subject = render_template(&self.subject_template, sensor, state, timestamp, value);
        match state {
            NotificationState::Normal => info!(sensor = sensor.identity(), %subject, "{}", message),
            NotificationState::Warning => warn!(sensor = sensor.identity(), %subject, "{}", message),
            NotificationState::Critical => error!(sensor = sensor.identity(), %subject, "{}", message),
        }

        let line = serde_json::json!({
            "timestamp": timestamp.to_rfc3339(),
            "sensor": sensor.identity(),
            "sensor_name": sensor.name(),
            "device": sensor.device().map(|d| d.name().to_string()),
            "state": state,
            "value": value,
            "subject": subject,
            "message": message,
        });
        if let Err(e) = self.append_notification(&line) {
            error!(location = "notify", sensor = sensor.identity(), error = %e, "Failed to spool notification");
        }
    }

    fn send_report(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
        data: &Table,
        format: ReportFormat,
        attachment_filename: &str,
    ) {
        let name = sanitize_filename(attachment_filename, format);
        let sheet = Path::new(&name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Sheet1");
        let attachment = report::render(data, format, sheet);
        if attachment.is_none() {
            warn!(report = %name, "Report has no attachment; sending body only");
        }

        let envelope = serde_json::json!({
            "recipients": recipients,
            "subject": subject,
            "body": body,
            "attachment": attachment.as_ref().map(|_| name.clone()),
            "content_type": format.mime_type(),
            "rows": data.rows.len(),
        });
        match self.write_pair(&name, attachment.as_deref(), &envelope) {
            Ok(()) => info!(report = %name, recipients = recipients.len(), "Report spooled"),
            Err(e) => error!(location = "send_report", report = %name, error = %e, "Failed to spool report"),
        }
    }

    fn upload_report(
        &self,
        data: &Table,
        include_header: bool,
        url: &str,
        verb: HttpVerb,
        credentials: Option<&Credentials>,
    ) {
        let payload = match report::to_delimited(data, include_header) {
            Ok(p) => p,
            Err(e) => {
                error!(location = "upload_report", %url, error = %e, "Failed to render upload");
                return;
            }
        };

        let name = format!("upload-{}.csv", Utc::now().timestamp_millis());
        let envelope = serde_json::json!({
            "url": url,
            "verb": verb,
            "username": credentials.map(|c| c.username.clone()),
            "include_header": include_header,
            "rows": data.rows.len(),
        });
        match self.write_pair(&name, Some(&payload), &envelope) {
            Ok(()) => info!(upload = %name, %url, %verb, "Upload spooled"),
            Err(e) => error!(location = "upload_report", %url, error = %e, "Failed to spool upload"),
        }
    }
}
