//! WinRT GATT backend
//!
//! Opens the car by address and resolves the three characteristics up front.
//! Status and battery are optional: cars without them still drive.

use crate::infrastructure::bluetooth::link::{
    GattLink, LinkConnector, LinkError, LinkEvent, LinkEventSender,
};
use crate::infrastructure::bluetooth::protocol::{BleAddress, Characteristic};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{
    BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

impl From<windows::core::Error> for LinkError {
    fn from(error: windows::core::Error) -> Self {
        LinkError::Platform(error.to_string())
    }
}

/// Parse a UUID string into a Windows GUID
pub fn parse_uuid(uuid_str: &str) -> Result<GUID, LinkError> {
    let hex = uuid_str.replace('-', "");
    let invalid = || LinkError::Platform(format!("invalid UUID {}", uuid_str));

    if hex.len() != 32 {
        return Err(invalid());
    }

    let data1 = u32::from_str_radix(&hex[0..8], 16).map_err(|_| invalid())?;
    let data2 = u16::from_str_radix(&hex[8..12], 16).map_err(|_| invalid())?;
    let data3 = u16::from_str_radix(&hex[12..16], 16).map_err(|_| invalid())?;

    let mut data4 = [0u8; 8];
    for (i, byte) in data4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[16 + i * 2..18 + i * 2], 16).map_err(|_| invalid())?;
    }

    Ok(GUID {
        data1,
        data2,
        data3,
        data4,
    })
}

fn read_buffer(buffer: &IBuffer) -> Result<Vec<u8>, LinkError> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn check_status(
    status: GattCommunicationStatus,
    operation: &'static str,
    characteristic: Characteristic,
) -> Result<(), LinkError> {
    if status == GattCommunicationStatus::Success {
        return Ok(());
    }
    if status == GattCommunicationStatus::Unreachable {
        return Err(LinkError::LinkLost);
    }
    Err(LinkError::Gatt {
        operation,
        characteristic,
        status: format!("{:?}", status),
    })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WinRtConnector;

impl WinRtConnector {
    async fn find_characteristic(
        device: &BluetoothLEDevice,
        characteristic: Characteristic,
    ) -> Result<GattCharacteristic, LinkError> {
        let service_uuid = parse_uuid(characteristic.service_uuid())?;
        let char_uuid = parse_uuid(characteristic.uuid())?;

        let services_result = device
            .GetGattServicesForUuidWithCacheModeAsync(service_uuid, BluetoothCacheMode::Uncached)?
            .await?;
        check_status(services_result.Status()?, "service lookup", characteristic)?;

        let services = services_result.Services()?;
        if services.Size()? == 0 {
            return Err(LinkError::ServiceNotFound(characteristic.service_uuid()));
        }
        let service = services.GetAt(0)?;

        let chars_result = service
            .GetCharacteristicsForUuidWithCacheModeAsync(char_uuid, BluetoothCacheMode::Uncached)?
            .await?;
        check_status(chars_result.Status()?, "characteristic lookup", characteristic)?;

        let characteristics = chars_result.Characteristics()?;
        if characteristics.Size()? == 0 {
            return Err(LinkError::CharacteristicNotFound(characteristic));
        }
        Ok(characteristics.GetAt(0)?)
    }
}

#[async_trait(?Send)]
impl LinkConnector for WinRtConnector {
    type Link = WinRtLink;

    async fn connect(
        &self,
        address: BleAddress,
        events: LinkEventSender,
    ) -> Result<WinRtLink, LinkError> {
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address.raw())?
            .await
            .map_err(|_| LinkError::DeviceNotFound(address))?;
        info!("Device opened: {:?}", device.Name()?);

        let mut characteristics = HashMap::new();
        characteristics.insert(
            Characteristic::Control,
            Self::find_characteristic(&device, Characteristic::Control).await?,
        );
        for optional in [Characteristic::Status, Characteristic::Battery] {
            match Self::find_characteristic(&device, optional).await {
                Ok(found) => {
                    characteristics.insert(optional, found);
                }
                Err(e) => warn!("{} characteristic unavailable: {}", optional, e),
            }
        }

        let sender = events.clone();
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let _ = sender.send(LinkEvent::Dropped);
                    }
                }
                Ok(())
            });
        let status_token = device.ConnectionStatusChanged(&status_handler)?;

        Ok(WinRtLink {
            device,
            status_token,
            characteristics,
            notify_tokens: HashMap::new(),
            events,
        })
    }
}

pub struct WinRtLink {
    device: BluetoothLEDevice,
    status_token: i64,
    characteristics: HashMap<Characteristic, GattCharacteristic>,
    notify_tokens: HashMap<Characteristic, i64>,
    events: LinkEventSender,
}

impl WinRtLink {
    fn characteristic(&self, characteristic: Characteristic) -> Result<&GattCharacteristic, LinkError> {
        self.characteristics
            .get(&characteristic)
            .ok_or(LinkError::CharacteristicNotFound(characteristic))
    }
}

#[async_trait(?Send)]
impl GattLink for WinRtLink {
    async fn subscribe(&mut self, characteristic: Characteristic) -> Result<(), LinkError> {
        let gatt = self.characteristic(characteristic)?.clone();

        // Register the handler first so the first notification is not missed.
        let sender = self.events.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    if let Ok(data) = read_buffer(&args.CharacteristicValue()?) {
                        let _ = sender.send(LinkEvent::Notification {
                            characteristic,
                            data,
                        });
                    }
                }
                Ok(())
            },
        );
        let token = gatt.ValueChanged(&handler)?;

        let status = gatt
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?
            .await?;
        if let Err(e) = check_status(status, "subscribe", characteristic) {
            let _ = gatt.RemoveValueChanged(token);
            return Err(e);
        }

        self.notify_tokens.insert(characteristic, token);
        Ok(())
    }

    async fn unsubscribe(&mut self, characteristic: Characteristic) -> Result<(), LinkError> {
        let gatt = self.characteristic(characteristic)?.clone();
        if let Some(token) = self.notify_tokens.remove(&characteristic) {
            gatt.RemoveValueChanged(token)?;
        }
        let status = gatt
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::None,
            )?
            .await?;
        check_status(status, "unsubscribe", characteristic)
    }

    async fn write(
        &mut self,
        characteristic: Characteristic,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        let gatt = self.characteristic(characteristic)?.clone();
        let writer = DataWriter::new()?;
        writer.WriteBytes(payload)?;
        let buffer = writer.DetachBuffer()?;

        let status = gatt
            .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithoutResponse)?
            .await?;
        check_status(status, "write", characteristic)
    }

    async fn read(&mut self, characteristic: Characteristic) -> Result<Vec<u8>, LinkError> {
        let gatt = self.characteristic(characteristic)?.clone();
        let result = gatt
            .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        check_status(result.Status()?, "read", characteristic)?;
        read_buffer(&result.Value()?)
    }

    async fn disconnect(&mut self) {
        for (characteristic, token) in self.notify_tokens.drain() {
            if let Some(gatt) = self.characteristics.get(&characteristic) {
                let _ = gatt.RemoveValueChanged(token);
            }
        }
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        self.characteristics.clear();
        if let Err(e) = self.device.Close() {
            debug!("Device close failed: {}", e);
        }
        info!("Device released");
    }
}
