use secure_dfu::transport::{
    ControlChannel, DataChannel, DeviceDescriptor, Discovered, Discovery, Notifications, TransportError,
};

use anyhow::{Context, anyhow};
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::future;
use futures::stream::{BoxStream, StreamExt};

fn backend(e: btleplug::Error) -> TransportError {
    TransportError::Backend(Box::new(e))
}

/// Scans the first Bluetooth adapter for DFU targets
pub struct BleDiscovery {
    adapter: Adapter,
}

impl BleDiscovery {
    pub async fn new() -> anyhow::Result<Self> {
        let manager = btleplug::platform::Manager::new().await?;
        let adapters = manager.adapters().await?;
        if let Some(adapter) = adapters.into_iter().next() {
            Ok(BleDiscovery { adapter })
        } else {
            Err(anyhow!("No Bluetooth adapter found"))
        }
    }

    pub async fn connect(&self, peripheral: Peripheral) -> anyhow::Result<BleTransport> {
        peripheral.connect().await.context("Failed to establish a connection")?;
        peripheral.discover_services().await.context("Service discovery failed")?;
        Ok(BleTransport { peripheral })
    }
}

impl Discovery for BleDiscovery {
    type Device = Peripheral;

    async fn scan(&self) -> Result<BoxStream<'static, Discovered<Peripheral>>, TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await.map_err(backend)?;
        let events = self.adapter.events().await.map_err(backend)?;
        let adapter = self.adapter.clone();
        let devices = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let CentralEvent::DeviceDiscovered(id) = event else {
                    return None;
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok()??;
                let descriptor = DeviceDescriptor {
                    id: properties.address.to_string(),
                    name: properties.local_name,
                };
                Some(Discovered {
                    descriptor,
                    device: peripheral,
                })
            }
        });
        Ok(devices.boxed())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await.map_err(backend)
    }
}

/// A connected DFU target
pub struct BleTransport {
    peripheral: Peripheral,
}

impl BleTransport {
    fn characteristic(&self, uuid: uuid::Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|char| char.uuid == uuid)
            .ok_or_else(|| TransportError::CharacteristicNotFound(uuid.to_string()))
    }

    /// Command/response channel on the given characteristic
    pub fn control(&self, uuid: uuid::Uuid) -> Result<BleControl, TransportError> {
        Ok(BleControl {
            peripheral: self.peripheral.clone(),
            characteristic: self.characteristic(uuid)?,
        })
    }

    pub fn data(&self, uuid: uuid::Uuid) -> Result<BleData, TransportError> {
        Ok(BleData {
            peripheral: self.peripheral.clone(),
            characteristic: self.characteristic(uuid)?,
        })
    }

    pub async fn disconnect(&self) -> anyhow::Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

pub struct BleControl {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

impl ControlChannel for BleControl {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.characteristic, bytes, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn notifications(&self) -> Result<Notifications, TransportError> {
        self.peripheral
            .subscribe(&self.characteristic)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        let uuid = self.characteristic.uuid;
        let notifications = self.peripheral.notifications().await.map_err(backend)?;
        Ok(notifications
            .filter(move |ntf| future::ready(ntf.uuid == uuid))
            .map(|ntf| ntf.value)
            .boxed())
    }
}

pub struct BleData {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

impl DataChannel for BleData {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.characteristic, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }
}

/// nRF DFU service & characteristic UUIDs
///
/// from [DFU BLE Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/group__nrf__dfu__ble.html)
/// and [Buttonless DFU Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/service_dfu.html)
pub mod dfu_uuids {
    use uuid::Uuid;
    /// Control Point Characteristic
    pub const CTRL_PT: Uuid = Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);
    /// Data Characteristic
    pub const DATA_PT: Uuid = Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);
    /// Buttonless DFU trigger without bonds Characteristic
    pub const BTTNLSS: Uuid = Uuid::from_u128(0x8EC90003_F315_4F60_9FB8_838830DAEA50);
}
