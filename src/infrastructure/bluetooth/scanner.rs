//! BLE Scanner Module
//!
//! One-shot discovery of nearby cars. Listens to advertisements for a fixed
//! window and returns the devices whose advertised name matches a filter.

use crate::infrastructure::bluetooth::link::LinkError;
use crate::infrastructure::bluetooth::protocol::BleAddress;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: BleAddress,
    pub signal_strength: i16,
}

/// Case-insensitive substring match against any filter. An empty filter
/// list accepts every named device.
pub fn name_matches(name: &str, filters: &[String]) -> bool {
    if name.is_empty() {
        return false;
    }
    let name = name.to_lowercase();
    filters.is_empty()
        || filters
            .iter()
            .any(|filter| name.contains(&filter.to_lowercase()))
}

/// Keep the newest advertisement per address, drop non-matching names and
/// order by signal strength.
fn collect_matches(
    advertisements: impl IntoIterator<Item = DiscoveredDevice>,
    filters: &[String],
) -> Vec<DiscoveredDevice> {
    let mut by_address: HashMap<BleAddress, DiscoveredDevice> = HashMap::new();
    for device in advertisements {
        if !name_matches(&device.name, filters) {
            continue;
        }
        by_address.insert(device.address, device);
    }
    let mut devices: Vec<_> = by_address.into_values().collect();
    devices.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
    devices
}

/// Scan for `window` (or until cancelled) and return matching cars.
pub async fn discover(
    window: Duration,
    filters: &[String],
    cancel: CancellationToken,
) -> Result<Vec<DiscoveredDevice>, LinkError> {
    info!("Scanning for cars for {:?}", window);
    let advertisements = listen(window, cancel).await?;
    let devices = collect_matches(advertisements, filters);
    info!("Scan finished, {} matching device(s)", devices.len());
    Ok(devices)
}

#[cfg(windows)]
async fn listen(
    window: Duration,
    cancel: CancellationToken,
) -> Result<Vec<DiscoveredDevice>, LinkError> {
    use tokio::sync::mpsc;
    use windows::Devices::Bluetooth::Advertisement::{
        BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
        BluetoothLEScanningMode,
    };
    use windows::Foundation::TypedEventHandler;

    let watcher = BluetoothLEAdvertisementWatcher::new()?;
    watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

    let (sender, mut receiver) = mpsc::unbounded_channel();
    let handler = TypedEventHandler::new(
        move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
              args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
            if let Some(args) = args.as_ref() {
                let name = args.Advertisement()?.LocalName()?.to_string();
                let _ = sender.send(DiscoveredDevice {
                    name,
                    address: BleAddress::from_raw(args.BluetoothAddress()?),
                    signal_strength: args.RawSignalStrengthInDBm()?,
                });
            }
            Ok(())
        },
    );

    watcher.Received(&handler)?;
    watcher.Start()?;

    tokio::select! {
        _ = tokio::time::sleep(window) => {}
        _ = cancel.cancelled() => info!("Scan cancelled"),
    }

    info!("Stopping BLE scan...");
    watcher.Stop()?;

    let mut seen = Vec::new();
    while let Ok(device) = receiver.try_recv() {
        seen.push(device);
    }
    Ok(seen)
}

#[cfg(not(windows))]
async fn listen(
    _window: Duration,
    _cancel: CancellationToken,
) -> Result<Vec<DiscoveredDevice>, LinkError> {
    Err(LinkError::Unsupported)
}
