//! Device session and connection lifecycle.
//!
//! An [`EdlSession`] owns one transport and everything the device library
//! tracks about the device behind it: connection state, staged commands,
//! the applied protocol, advisory status counters and partially read sample
//! bytes. There is no process-wide state; two sessions on two transports are
//! fully independent.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                        │                  │
//!      └────────failure─────────┘             disconnect
//!      ▲                                           │
//!      └───────────ok──────────── Disconnecting ◀──┘
//! ```
//!
//! All mutating operations take `&mut self`, so a session has exactly one
//! writer. To acquire on another thread, move the session into an
//! [`AcquisitionWorker`](crate::continuous::AcquisitionWorker).

use std::fmt;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, error, info, warn};

use crate::acquisition::{Pacer, ThreadSleep};
use crate::codec;
use crate::command::{CurrentRange, FinalBandwidth, SamplingRate};
use crate::config::SessionConfig;
use crate::error::{EdlError, Result};
use crate::protocol::ProtocolParameters;
use crate::stager::StagingState;
use crate::status::StatusMonitor;
use crate::transport::{DeviceId, LinkInfo, Transport, TransportError};

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No link is open.
    #[default]
    Disconnected,
    /// `connect` is configuring a freshly opened link.
    Connecting,
    /// The link is open and configured.
    Connected,
    /// `disconnect` is closing the link.
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        write!(f, "{}", label)
    }
}

/// Settings last committed to the device.
///
/// `None` until the corresponding command has been sent in this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceSettings {
    /// Current range
    pub range: Option<CurrentRange>,
    /// Sampling rate
    pub sampling_rate: Option<SamplingRate>,
    /// Final bandwidth of the current channels
    pub bandwidth: Option<FinalBandwidth>,
    /// State of the reset checkbox
    pub reset: Option<bool>,
}

impl DeviceSettings {
    /// Unit of the current channels, if the range is known.
    pub fn current_unit(&self) -> Option<&'static str> {
        self.range.map(CurrentRange::unit)
    }

    /// Filter cut-off in Hz, if both rate and bandwidth are known.
    pub fn cutoff_hz(&self) -> Option<f64> {
        match (self.bandwidth, self.sampling_rate) {
            (Some(bw), Some(rate)) => Some(bw.cutoff_hz(rate)),
            _ => None,
        }
    }
}

/// A session with one E4 device.
pub struct EdlSession<T: Transport> {
    pub(crate) transport: T,
    pub(crate) config: SessionConfig,
    pub(crate) state: ConnectionState,
    pub(crate) link: Option<LinkInfo>,
    pub(crate) staging: StagingState,
    pub(crate) applied: ProtocolParameters,
    pub(crate) settings: DeviceSettings,
    pub(crate) monitor: StatusMonitor,
    /// Sample bytes read past the last whole packet.
    pub(crate) carry: BytesMut,
    pub(crate) pacer: Box<dyn Pacer>,
}

impl<T: Transport> EdlSession<T> {
    /// Create a disconnected session over `transport`.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            state: ConnectionState::Disconnected,
            link: None,
            staging: StagingState::default(),
            applied: ProtocolParameters::new(),
            settings: DeviceSettings::default(),
            monitor: StatusMonitor::default(),
            carry: BytesMut::new(),
            pacer: Box::new(ThreadSleep),
        }
    }

    /// Replace how the session waits between polls and close retries.
    pub fn with_pacer(mut self, pacer: impl Pacer + 'static) -> Self {
        self.pacer = Box::new(pacer);
        self
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `true` in [`ConnectionState::Connected`].
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Device the session is connected to.
    pub fn device(&self) -> Option<&LinkInfo> {
        self.link.as_ref()
    }

    /// Configuration the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Settings committed to the device in this session.
    pub fn settings(&self) -> DeviceSettings {
        self.settings
    }

    /// Protocol parameters written to the device.
    ///
    /// Values uploaded by a setting commit show up here before the next
    /// apply starts them running.
    pub fn applied_protocol(&self) -> &ProtocolParameters {
        &self.applied
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// List devices available for connection.
    ///
    /// Only allowed without an open session.
    pub fn detect_devices(&mut self) -> Result<Vec<DeviceId>> {
        if let Some(link) = &self.link {
            return Err(EdlError::DeviceAlreadyConnected {
                device: link.device.clone(),
            });
        }

        let devices = match self.transport.enumerate() {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Device enumeration failed");
                return Err(EdlError::NoDevices);
            }
        };

        if devices.is_empty() {
            return Err(EdlError::NoDevices);
        }

        debug!(count = devices.len(), "Detected devices");
        Ok(devices)
    }

    /// Open a session with `device`.
    ///
    /// Opens the link, configures latency, USB parameters and transfer size,
    /// purges both directions and writes a probe frame. Any failure closes
    /// the link again and leaves the session disconnected.
    pub fn connect(&mut self, device: &str) -> Result<LinkInfo> {
        if let Some(link) = &self.link {
            return Err(EdlError::DeviceAlreadyConnected {
                device: link.device.clone(),
            });
        }

        self.state = ConnectionState::Connecting;
        debug!(device, "Connecting");

        let info = match self.transport.open(device) {
            Ok(info) => info,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(EdlError::DeviceConnection {
                    device: device.to_string(),
                    message: e.to_string(),
                });
            }
        };

        if info.expired {
            self.abort_connect();
            return Err(EdlError::DeviceExpired {
                device: info.device,
            });
        }

        if let Err(e) = self.configure_link() {
            self.abort_connect();
            return Err(e);
        }

        self.reset_device_state();
        self.state = ConnectionState::Connected;
        self.link = Some(info.clone());

        info!(
            device = %info.device,
            description = %info.description,
            "Connected to device"
        );

        Ok(info)
    }

    /// Close the session.
    ///
    /// Closing is retried up to `disconnect_attempts` times with
    /// `disconnect_backoff` in between. If every attempt fails the session
    /// stays connected.
    pub fn disconnect(&mut self) -> Result<()> {
        self.ensure_connected()?;
        self.state = ConnectionState::Disconnecting;

        let attempts = self.config.connection.disconnect_attempts.max(1);
        let backoff = self.config.connection.disconnect_backoff();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.transport.close() {
                Ok(()) | Err(TransportError::Disconnected) => {
                    let device = self.link.take().map(|l| l.device).unwrap_or_default();
                    self.reset_device_state();
                    self.state = ConnectionState::Disconnected;
                    info!(device = %device, attempt, "Disconnected from device");
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Close attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        self.pacer.pause(backoff);
                    }
                }
            }
        }

        self.state = ConnectionState::Connected;
        let message = last_error.map(|e| e.to_string()).unwrap_or_default();
        warn!(attempts, error = %message, "Giving up on disconnect");
        Err(EdlError::DeviceDisconnection { attempts, message })
    }

    /// Discard samples queued on the device and any partial packet held
    /// by the session.
    pub fn purge_data(&mut self) -> Result<()> {
        self.ensure_connected()?;
        match self.transport.purge() {
            Ok(()) => {}
            Err(TransportError::Disconnected) => return Err(self.link_lost()),
            Err(e) => {
                return Err(EdlError::Unknown {
                    message: format!("purge failed: {}", e),
                })
            }
        }
        let dropped = self.carry.len();
        self.carry.clear();
        debug!(dropped_bytes = dropped, "Purged device data");
        Ok(())
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(EdlError::DeviceNotConnected)
        }
    }

    /// The link went away underneath the session.
    ///
    /// Tears the session down and returns the error to report.
    pub(crate) fn link_lost(&mut self) -> EdlError {
        let device = self.link.take().map(|l| l.device).unwrap_or_default();
        error!(device = %device, "Lost link to device");
        let _ = self.transport.close();
        self.reset_device_state();
        self.state = ConnectionState::Disconnected;
        EdlError::DeviceNotConnected
    }

    pub(crate) fn pause(&mut self, interval: Duration) {
        self.pacer.pause(interval);
    }

    fn configure_link(&mut self) -> Result<()> {
        let conn = &self.config.connection;

        self.transport
            .set_latency(conn.latency())
            .map_err(|e| EdlError::DeviceConnectionLatency {
                message: e.to_string(),
            })?;

        self.transport
            .set_usb_parameters(
                Duration::from_millis(conn.read_timeout_ms),
                Duration::from_millis(conn.write_timeout_ms),
            )
            .map_err(|e| EdlError::DeviceConnectionSetUsb {
                message: e.to_string(),
            })?;

        self.transport
            .set_transfer_size(conn.in_transfer_size, conn.out_transfer_size)
            .map_err(|e| EdlError::DeviceConnectionTransferSize {
                message: e.to_string(),
            })?;

        self.transport
            .purge()
            .map_err(|e| EdlError::DeviceConnectionPurge {
                message: e.to_string(),
            })?;

        let probe = codec::probe_frame();
        match self.transport.write(&probe) {
            Ok(n) if n == probe.len() => Ok(()),
            Ok(n) => Err(EdlError::DeviceConnectionFirstWrite {
                message: format!("short write: {} of {} bytes", n, probe.len()),
            }),
            Err(e) => Err(EdlError::DeviceConnectionFirstWrite {
                message: e.to_string(),
            }),
        }
    }

    fn abort_connect(&mut self) {
        if let Err(e) = self.transport.close() {
            debug!(error = %e, "Close after failed connect");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn reset_device_state(&mut self) {
        self.staging.clear();
        self.applied = ProtocolParameters::new();
        self.settings = DeviceSettings::default();
        self.monitor.reset();
        self.carry.clear();
    }

    fn close_on_drop(&mut self) {
        if self.link.is_some() {
            if let Err(e) = self.transport.close() {
                error!("Error closing device on drop: {}", e);
            }
            self.link = None;
            self.state = ConnectionState::Disconnected;
        }
    }
}

impl<T: Transport> Drop for EdlSession<T> {
    fn drop(&mut self) {
        self.close_on_drop();
    }
}

impl<T: Transport> fmt::Debug for EdlSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdlSession")
            .field("state", &self.state)
            .field("link", &self.link)
            .field("staged", &self.staging.len())
            .field("carry_bytes", &self.carry.len())
            .finish()
    }
}
