//! Bluetooth Service Module
//!
//! Owns the thread and single-threaded runtime every BLE operation runs on.
//! The UI thread talks to it through [`SessionHandle`]s and one-shot scan
//! replies, never by blocking on the radio.

use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::event_bus::{EventBus, EventReceiver};
use crate::infrastructure::bluetooth::link::LinkError;
use crate::infrastructure::bluetooth::protocol::BleAddress;
use crate::infrastructure::bluetooth::scanner::{self, DiscoveredDevice};
use crate::infrastructure::bluetooth::session::{ConnectionSession, SessionConfig, SessionHandle};
use crate::infrastructure::bluetooth::PlatformConnector;
use anyhow::{Context, Result};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub type DiscoveryResult = Result<Vec<DiscoveredDevice>, LinkError>;

enum ServiceRequest {
    Run(ConnectionSession<PlatformConnector>),
    Discover {
        window: Duration,
        filters: Vec<String>,
        cancel: CancellationToken,
        reply: oneshot::Sender<DiscoveryResult>,
    },
}

pub struct BluetoothService {
    requests: Option<mpsc::UnboundedSender<ServiceRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl BluetoothService {
    /// Spawn the BLE thread.
    pub fn start() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create tokio runtime for Bluetooth")?;
        let (requests, receiver) = mpsc::unbounded_channel();

        let worker = std::thread::Builder::new()
            .name("ble-session".to_string())
            .spawn(move || {
                let local = LocalSet::new();
                local.block_on(&runtime, serve(receiver));
                info!("Bluetooth thread exiting");
            })
            .context("Failed to spawn Bluetooth thread")?;

        Ok(Self {
            requests: Some(requests),
            worker: Some(worker),
        })
    }

    /// Start a session for `address`. The returned receiver sees the
    /// session's events and ends with the shutdown sentinel.
    pub fn connect(&self, address: BleAddress, settings: &Settings) -> (SessionHandle, EventReceiver) {
        let (bus, events) = EventBus::bounded(settings.event_bus_capacity);
        let (session, handle) = ConnectionSession::new(
            PlatformConnector::default(),
            address,
            SessionConfig::from(settings),
            bus,
        );

        if !self.send(ServiceRequest::Run(session)) {
            // The session was dropped with the request, so its bus closes and
            // the receiver reports shutdown on the next drain.
            error!("Bluetooth thread is gone, cannot connect to {}", address);
        }
        (handle, events)
    }

    /// Scan in the background. The reply resolves when the window closes or
    /// `cancel` fires.
    pub fn discover(
        &self,
        window: Duration,
        filters: Vec<String>,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<DiscoveryResult> {
        let (reply, receiver) = oneshot::channel();
        if !self.send(ServiceRequest::Discover {
            window,
            filters,
            cancel,
            reply,
        }) {
            error!("Bluetooth thread is gone, cannot scan");
        }
        receiver
    }

    /// Close the request channel, let running sessions finish their
    /// teardown, then join the thread.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn send(&self, request: ServiceRequest) -> bool {
        self.requests
            .as_ref()
            .is_some_and(|requests| requests.send(request).is_ok())
    }

    fn close(&mut self) {
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Bluetooth thread panicked");
            }
        }
    }
}

impl Drop for BluetoothService {
    fn drop(&mut self) {
        self.close();
    }
}

async fn serve(mut requests: mpsc::UnboundedReceiver<ServiceRequest>) {
    let mut sessions: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    while let Some(request) = requests.recv().await {
        match request {
            ServiceRequest::Run(session) => {
                sessions.retain(|task| !task.is_finished());
                sessions.push(tokio::task::spawn_local(session.run()));
                debug!("{} session task(s) live", sessions.len());
            }
            ServiceRequest::Discover {
                window,
                filters,
                cancel,
                reply,
            } => {
                tokio::task::spawn_local(async move {
                    let result = scanner::discover(window, &filters, cancel).await;
                    let _ = reply.send(result);
                });
            }
        }
    }

    for task in sessions {
        if let Err(e) = task.await {
            error!("Session task failed: {}", e);
        }
    }
}
