//! Devices: connection context shared by a group of sensors.

use std::fmt;
use std::sync::Arc;

use crate::sensor::Sensor;

/// Credentials used by probes that reach a remote host.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// Read-only connection context handed to probes during collection.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    identity: u32,
    name: String,
    host: String,
    credentials: Option<Credentials>,
}

impl DeviceContext {
    pub fn new(identity: u32, name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            identity,
            name: name.into(),
            host: host.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn identity(&self) -> u32 {
        self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }
}

/// A device and the sensors it owns, in scan order.
#[derive(Debug)]
pub struct Device {
    context: Arc<DeviceContext>,
    sensors: Vec<Arc<Sensor>>,
}

impl Device {
    pub(crate) fn new(context: DeviceContext) -> Self {
        Self {
            context: Arc::new(context),
            sensors: Vec::new(),
        }
    }

    pub fn identity(&self) -> u32 {
        self.context.identity
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    pub fn sensors(&self) -> &[Arc<Sensor>] {
        &self.sensors
    }

    /// Binds the sensor to this device and appends it.
    pub(crate) fn attach(&mut self, identity: u32, mut sensor: Sensor) -> Arc<Sensor> {
        sensor.bind(identity, &self.context);
        let sensor = Arc::new(sensor);
        self.sensors.push(Arc::clone(&sensor));
        sensor
    }
}
