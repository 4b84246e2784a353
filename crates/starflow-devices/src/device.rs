/*!
 * Remote device endpoints.
 *
 * A [`RemoteDeviceEndpoint`] describes one Alpaca device on one server and
 * carries the bookkeeping the status sync engine keeps about it: capability
 * flags, online state, failure count and the last reported error.
 */
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use starflow_core::config::DeviceConfig;

use crate::error::{DeviceError, Result};

/// Identity properties every Alpaca device exposes
pub const COMMON_STARTUP_PROPERTIES: &[&str] = &[
    "name",
    "description",
    "driverinfo",
    "driverversion",
    "interfaceversion",
];

/// Alpaca device type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Imaging camera
    Camera,
    /// Dome or roll-off roof
    Dome,
    /// Filter wheel
    FilterWheel,
    /// Focuser
    Focuser,
    /// Weather station
    ObservingConditions,
    /// Field rotator
    Rotator,
    /// Safety monitor
    SafetyMonitor,
    /// Switch bank
    Switch,
    /// Telescope mount
    Telescope,
}

impl DeviceType {
    /// The lowercase tag used in Alpaca URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Camera => "camera",
            DeviceType::Dome => "dome",
            DeviceType::FilterWheel => "filterwheel",
            DeviceType::Focuser => "focuser",
            DeviceType::ObservingConditions => "observingconditions",
            DeviceType::Rotator => "rotator",
            DeviceType::SafetyMonitor => "safetymonitor",
            DeviceType::Switch => "switch",
            DeviceType::Telescope => "telescope",
        }
    }

    /// Properties polled one at a time when no bulk read is available
    pub fn status_properties(&self) -> &'static [&'static str] {
        match self {
            DeviceType::Camera => &[
                "camerastate",
                "ccdtemperature",
                "cooleron",
                "coolerpower",
                "imageready",
                "percentcompleted",
            ],
            DeviceType::Dome => &[
                "altitude",
                "athome",
                "atpark",
                "azimuth",
                "shutterstatus",
                "slewing",
            ],
            DeviceType::FilterWheel => &["position"],
            DeviceType::Focuser => &["position", "ismoving", "temperature", "tempcomp"],
            DeviceType::ObservingConditions => &[
                "cloudcover",
                "dewpoint",
                "humidity",
                "pressure",
                "rainrate",
                "skybrightness",
                "skytemperature",
                "temperature",
                "winddirection",
                "windspeed",
            ],
            DeviceType::Rotator => &["position", "ismoving", "mechanicalposition", "targetposition"],
            DeviceType::SafetyMonitor => &["issafe"],
            DeviceType::Switch => &[],
            DeviceType::Telescope => &[
                "altitude",
                "azimuth",
                "rightascension",
                "declination",
                "siderealtime",
                "sideofpier",
                "slewing",
                "tracking",
                "athome",
                "atpark",
            ],
        }
    }

    /// Static properties fetched once per (re)connection, after the common ones
    pub fn startup_properties(&self) -> &'static [&'static str] {
        match self {
            DeviceType::Camera => &["cameraxsize", "cameraysize", "maxbinx", "maxbiny", "sensorname"],
            DeviceType::Dome => &[
                "canfindhome",
                "canpark",
                "cansetaltitude",
                "cansetazimuth",
                "cansetshutter",
                "canslave",
            ],
            DeviceType::FilterWheel => &["names", "focusoffsets"],
            DeviceType::Focuser => &["absolute", "maxincrement", "maxstep", "stepsize", "tempcompavailable"],
            DeviceType::ObservingConditions => &["averageperiod"],
            DeviceType::Rotator => &["canreverse", "stepsize"],
            DeviceType::SafetyMonitor => &[],
            DeviceType::Switch => &["maxswitch"],
            DeviceType::Telescope => &[
                "alignmentmode",
                "aperturediameter",
                "canpark",
                "canslew",
                "cansettracking",
                "equatorialsystem",
            ],
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "camera" => Ok(DeviceType::Camera),
            "dome" => Ok(DeviceType::Dome),
            "filterwheel" => Ok(DeviceType::FilterWheel),
            "focuser" => Ok(DeviceType::Focuser),
            "observingconditions" => Ok(DeviceType::ObservingConditions),
            "rotator" => Ok(DeviceType::Rotator),
            "safetymonitor" => Ok(DeviceType::SafetyMonitor),
            "switch" => Ok(DeviceType::Switch),
            "telescope" => Ok(DeviceType::Telescope),
            other => Err(DeviceError::configuration(format!("unknown device type '{}'", other))),
        }
    }
}

/// What the device advertised in `supportedactions`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCapabilities {
    /// The device answers `readall`
    pub read_all: bool,
    /// The device answers `devicestate`
    pub device_state: bool,
    /// The device keeps a temperature log
    pub temperature_log: bool,
}

impl EndpointCapabilities {
    /// Derive capability flags from a `supportedactions` list
    pub fn from_actions<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut caps = Self::default();
        for action in actions {
            match action.as_ref().to_ascii_lowercase().as_str() {
                "readall" => caps.read_all = true,
                "devicestate" => caps.device_state = true,
                "temperaturelog" => caps.temperature_log = true,
                _ => {}
            }
        }
        caps
    }
}

/// The last error recorded against an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    /// ASCOM error number, if the device supplied one
    pub code: Option<i32>,
    /// Human readable message
    pub message: String,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// One Alpaca device on one server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDeviceEndpoint {
    /// Display name
    pub name: String,
    /// Host name or IP address
    pub address: String,
    /// Alpaca port
    pub port: u16,
    /// Device type
    pub device_type: DeviceType,
    /// Device number on the server
    pub device_number: u32,
    /// Capability flags
    pub capabilities: EndpointCapabilities,
    /// Whether capabilities were already known (skip the probe)
    pub capabilities_known: bool,
    /// Whether the last synchronization pass succeeded
    pub online: bool,
    /// Time of the last successful pass
    pub last_update: Option<DateTime<Utc>>,
    /// Failed passes since the last success
    pub consecutive_failures: u32,
    /// The last error seen
    pub last_error: Option<LastError>,
}

impl RemoteDeviceEndpoint {
    /// Create an endpoint with unknown capabilities
    pub fn new<S: Into<String>>(address: S, port: u16, device_type: DeviceType, device_number: u32) -> Self {
        let address = address.into();
        Self {
            name: format!("{}#{}", device_type, device_number),
            address,
            port,
            device_type,
            device_number,
            capabilities: EndpointCapabilities::default(),
            capabilities_known: false,
            online: false,
            last_update: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    /// Set the display name
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Use known capabilities instead of probing
    pub fn with_capabilities(mut self, capabilities: EndpointCapabilities) -> Self {
        self.capabilities = capabilities;
        self.capabilities_known = true;
        self
    }

    /// Build an endpoint from a `[[devices]]` configuration entry
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let device_type = config.device_type.parse()?;
        let mut endpoint = Self::new(config.address.clone(), config.port, device_type, config.device_number)
            .with_name(config.name.clone());

        if config.supports_read_all.is_some() || config.supports_device_state.is_some() {
            endpoint = endpoint.with_capabilities(EndpointCapabilities {
                read_all: config.supports_read_all.unwrap_or(false),
                device_state: config.supports_device_state.unwrap_or(false),
                temperature_log: false,
            });
        }
        Ok(endpoint)
    }

    /// `host:port` of the Alpaca server
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Path prefix of every request to this device
    pub fn api_path(&self) -> String {
        format!("/api/v1/{}/{}", self.device_type, self.device_number)
    }

    /// Record a successful pass; returns true on an offline to online transition
    pub fn record_success(&mut self, at: DateTime<Utc>) -> bool {
        let came_online = !self.online;
        self.online = true;
        self.consecutive_failures = 0;
        self.last_update = Some(at);
        came_online
    }

    /// Record a failed pass
    pub fn record_failure(&mut self, error: &DeviceError, at: DateTime<Utc>) {
        self.online = false;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(LastError {
            code: error.code(),
            message: error.to_string(),
            at,
        });
    }
}

impl fmt::Display for RemoteDeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}{})", self.name, self.authority(), self.api_path())
    }
}
