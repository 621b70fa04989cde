//! Capabilities the DFU engine consumes from the outside world.
//!
//! A transport backend provides the two DFU characteristics as a
//! [`ControlChannel`] and a [`DataChannel`], and optionally a [`Discovery`]
//! implementation used to find the target before a session starts.

use futures::stream::{BoxStream, StreamExt};
use std::io::{Read, Seek, SeekFrom};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("failed to subscribe to notifications: {0}")]
    SubscribeFailed(String),

    #[error("notifications stopped unexpectedly")]
    NotificationsClosed,

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(String),

    #[error("scanning stopped before a matching device was found")]
    ScanEnded,

    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Inbound notification frames, in arrival order
pub type Notifications = BoxStream<'static, Vec<u8>>;

/// Command/response channel (the DFU control point)
pub trait ControlChannel: Send + Sync {
    /// Write a request frame
    fn write(&self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;
    /// Subscribe to notifications; every call starts a fresh subscription
    fn notifications(&self) -> impl Future<Output = Result<Notifications, TransportError>> + Send;
}

/// Write-only bulk channel (the DFU data point)
pub trait DataChannel: Send + Sync {
    fn write(&self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Seekable firmware image of known length
pub trait FirmwareSource {
    fn length(&mut self) -> std::io::Result<u64>;
    fn seek(&mut self, offset: u64) -> std::io::Result<()>;
    /// Read into `buf`, returning 0 at the end of the image
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

impl<T: Read + Seek> FirmwareSource for T {
    fn length(&mut self) -> std::io::Result<u64> {
        let pos = Seek::stream_position(self)?;
        let len = Seek::seek(self, SeekFrom::End(0))?;
        Seek::seek(self, SeekFrom::Start(pos))?;
        Ok(len)
    }

    fn seek(&mut self, offset: u64) -> std::io::Result<()> {
        Seek::seek(self, SeekFrom::Start(offset))?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Read::read(self, buf)
    }
}

/// Identity of an advertising device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: Option<String>,
}

/// A scan result together with the backend's handle to the device
#[derive(Debug, Clone)]
pub struct Discovered<D> {
    pub descriptor: DeviceDescriptor,
    pub device: D,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFilter {
    Any,
    /// Exact advertised name
    Name(String),
    /// Case-insensitive suffix of the device id (e.g. the tail of a MAC address)
    IdSuffix(String),
}

impl DeviceFilter {
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        match self {
            DeviceFilter::Any => true,
            DeviceFilter::Name(name) => device.name.as_deref() == Some(name.as_str()),
            DeviceFilter::IdSuffix(suffix) => device.id.to_lowercase().ends_with(&suffix.to_lowercase()),
        }
    }
}

/// Scanner for devices advertising the DFU service
pub trait Discovery: Send + Sync {
    type Device: Send;

    /// Start scanning; the stream yields every device seen until stopped
    fn scan(
        &self,
    ) -> impl Future<Output = Result<BoxStream<'static, Discovered<Self::Device>>, TransportError>> + Send;
    fn stop(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Scan until a device matches `filter`, then stop scanning.
pub async fn find_device<S: Discovery>(
    discovery: &S,
    filter: &DeviceFilter,
) -> Result<Discovered<S::Device>, TransportError> {
    let mut devices = discovery.scan().await?;
    while let Some(found) = devices.next().await {
        tracing::debug!(id = %found.descriptor.id, name = ?found.descriptor.name, "device discovered");
        if filter.matches(&found.descriptor) {
            discovery.stop().await?;
            return Ok(found);
        }
    }
    discovery.stop().await?;
    Err(TransportError::ScanEnded)
}
