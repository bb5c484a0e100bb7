//! Collaborator contracts used by the worker task and reporting flows.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::device::Credentials;
use crate::report::{HttpVerb, ReportFormat, Table};
use crate::sensor::{NotificationState, Sensor};

/// Receives post-collection events and report requests.
///
/// Every operation logs and swallows its own failures; none of them may
/// panic into the caller.
pub trait NotificationPort: Send + Sync {
    /// Classifies a freshly collected value.
    fn evaluate(&self, sensor: &Sensor, timestamp: DateTime<Utc>, value: f64) -> NotificationState;

    /// Delivers a state-change notification.
    fn notify(
        &self,
        sensor: &Sensor,
        state: NotificationState,
        timestamp: DateTime<Utc>,
        value: f64,
        message: &str,
    );

    /// Sends a report with the table attached in the given format.
    fn send_report(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
        data: &Table,
        format: ReportFormat,
        attachment_filename: &str,
    );

    /// Uploads the table as delimited text to a remote endpoint.
    fn upload_report(
        &self,
        data: &Table,
        include_header: bool,
        url: &str,
        verb: HttpVerb,
        credentials: Option<&Credentials>,
    );
}

/// One persisted measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Errors returned by a data store. An unreadable series tail is not an
/// error: reads return the valid prefix.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Encode(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "I/O error: {}", e),
            StoreError::Encode(msg) => write!(f, "encode error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Persists one value series per sensor identity.
///
/// Calls for different identities may run concurrently. Calls for the same
/// identity are serialised by the scheduler.
pub trait DataStore: Send + Sync {
    fn write(&self, sensor_id: u32, timestamp: DateTime<Utc>, value: f64) -> Result<(), StoreError>;

    fn read_series(&self, sensor_id: u32) -> Result<Vec<DataPoint>, StoreError>;
}

/// The pair of collaborators handed to every worker task.
#[derive(Clone)]
pub struct Ports {
    pub notifier: Arc<dyn NotificationPort>,
    pub store: Arc<dyn DataStore>,
}

impl Ports {
    pub fn new(notifier: Arc<dyn NotificationPort>, store: Arc<dyn DataStore>) -> Self {
        Self { notifier, store }
    }
}

impl fmt::Debug for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ports").finish_non_exhaustive()
    }
}
