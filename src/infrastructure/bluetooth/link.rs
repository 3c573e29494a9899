//! Physical link abstraction
//!
//! The session drives the car through these traits so the radio backend can
//! be swapped (WinRT on Windows, a scripted link in tests).

use crate::infrastructure::bluetooth::protocol::{BleAddress, Characteristic};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("device {0} not found")]
    DeviceNotFound(BleAddress),
    #[error("service {0} not found")]
    ServiceNotFound(&'static str),
    #[error("{0} characteristic not found")]
    CharacteristicNotFound(Characteristic),
    #[error("GATT {operation} on {characteristic} failed: {status}")]
    Gatt {
        operation: &'static str,
        characteristic: Characteristic,
        status: String,
    },
    #[error("link lost")]
    LinkLost,
    #[error("no BLE backend available on this platform")]
    Unsupported,
    #[error("{0}")]
    Platform(String),
}

impl LinkError {
    /// Errors after which the connection itself is gone.
    pub fn is_link_lost(&self) -> bool {
        matches!(self, Self::LinkLost | Self::DeviceNotFound(_))
    }
}

/// Unsolicited traffic from the link, delivered in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification {
        characteristic: Characteristic,
        data: Vec<u8>,
    },
    Dropped,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// An open GATT connection.
///
/// Every method may suspend. The session never calls two of them
/// concurrently.
#[async_trait(?Send)]
pub trait GattLink {
    async fn subscribe(&mut self, characteristic: Characteristic) -> Result<(), LinkError>;

    async fn unsubscribe(&mut self, characteristic: Characteristic) -> Result<(), LinkError>;

    /// Write without response.
    async fn write(
        &mut self,
        characteristic: Characteristic,
        payload: &[u8],
    ) -> Result<(), LinkError>;

    async fn read(&mut self, characteristic: Characteristic) -> Result<Vec<u8>, LinkError>;

    /// Release the underlying device. Best effort, never fails.
    async fn disconnect(&mut self);
}

/// Opens links. Notifications and link drops for the opened link are
/// pushed into `events`.
#[async_trait(?Send)]
pub trait LinkConnector {
    type Link: GattLink;

    async fn connect(
        &self,
        address: BleAddress,
        events: LinkEventSender,
    ) -> Result<Self::Link, LinkError>;
}

/// Connector for platforms without a BLE backend; every connect fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedConnector;

/// Uninhabited: [`UnsupportedConnector`] never produces a link.
#[derive(Debug)]
pub enum NoLink {}

#[async_trait(?Send)]
impl GattLink for NoLink {
    async fn subscribe(&mut self, _: Characteristic) -> Result<(), LinkError> {
        match *self {}
    }

    async fn unsubscribe(&mut self, _: Characteristic) -> Result<(), LinkError> {
        match *self {}
    }

    async fn write(&mut self, _: Characteristic, _: &[u8]) -> Result<(), LinkError> {
        match *self {}
    }

    async fn read(&mut self, _: Characteristic) -> Result<Vec<u8>, LinkError> {
        match *self {}
    }

    async fn disconnect(&mut self) {
        match *self {}
    }
}

#[async_trait(?Send)]
impl LinkConnector for UnsupportedConnector {
    type Link = NoLink;

    async fn connect(&self, _: BleAddress, _: LinkEventSender) -> Result<NoLink, LinkError> {
        Err(LinkError::Unsupported)
    }
}
