use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{BikeError, Result},
    types::{ConnectionParams, DeviceInfo},
    DOMYOS_NOTIFY_CHAR_UUID, DOMYOS_SERVICE_UUID, DOMYOS_WRITE_CHAR_UUID,
};

/// Pause between two looks at the adapter's peripheral list while scanning
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Something the link reports without being asked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A notification on the notify characteristic
    Notification(Bytes),
    /// The link dropped
    Disconnected,
}

/// GATT link to one bike
///
/// Every step of the connection sequence is a separate call so the driver
/// can move its state machine in between. `next_event` must be cancel safe.
#[async_trait]
pub trait Transport: Send {
    /// Look for a supported bike for one scan window
    async fn scan(&mut self, params: &ConnectionParams) -> Result<Option<DeviceInfo>>;

    /// Connect to the bike found by the last successful scan
    async fn connect(&mut self, params: &ConnectionParams) -> Result<()>;

    /// Make sure the communication service is present
    async fn discover_service(&mut self) -> Result<()>;

    /// Resolve the write/notify characteristics and subscribe to notifications
    async fn bind_characteristics(&mut self) -> Result<()>;

    /// Write one chunk to the write characteristic and wait for completion
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Next unsolicited event, `None` once the transport is closed for good
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Drop the link
    async fn disconnect(&mut self) -> Result<()>;
}

fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| BikeError::Protocol(format!("Invalid {what} UUID: {e}")))
}

/// [`Transport`] backed by btleplug
pub struct BleTransport {
    manager: Manager,
    adapter: Option<Adapter>,
    peripheral: Option<Peripheral>,
    write_char: Option<Characteristic>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl BleTransport {
    /// Create a transport on the platform's Bluetooth stack
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            manager,
            adapter: None,
            peripheral: None,
            write_char: None,
            events_tx,
            events_rx,
            tasks: Vec::new(),
        })
    }

    async fn adapter(&mut self) -> Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let adapter = self
            .manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BikeError::DeviceNotFound)?;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    fn peripheral(&self) -> Result<&Peripheral> {
        self.peripheral.as_ref().ok_or(BikeError::DeviceNotFound)
    }

    /// Stop the forwarding tasks of the previous link and drop their leftovers
    fn stop_forwarding(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        while self.events_rx.try_recv().is_ok() {}
    }

    async fn matching_bike(adapter: &Adapter) -> Result<Option<(Peripheral, DeviceInfo)>> {
        for peripheral in adapter.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let Some(name) = properties.local_name else {
                continue;
            };
            let info = DeviceInfo::new(
                name,
                properties.address.to_string(),
                properties.rssi.unwrap_or(0),
            );
            debug!("Found device: {} ({})", info.name, info.address);
            if info.profile().is_some() {
                return Ok(Some((peripheral, info)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn scan(&mut self, params: &ConnectionParams) -> Result<Option<DeviceInfo>> {
        info!("Scanning for Domyos bikes...");
        let adapter = self.adapter().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        let deadline = Instant::now() + Duration::from_millis(params.scan_timeout_ms);
        let found = loop {
            if let Some(found) = Self::matching_bike(&adapter).await? {
                break Some(found);
            }
            if Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        };

        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        Ok(found.map(|(peripheral, info)| {
            info!("Found Domyos bike: {} ({})", info.name, info.address);
            self.peripheral = Some(peripheral);
            info
        }))
    }

    async fn connect(&mut self, params: &ConnectionParams) -> Result<()> {
        self.stop_forwarding();
        let peripheral = self.peripheral()?.clone();

        timeout(Duration::from_millis(params.timeout_ms), peripheral.connect())
            .await
            .map_err(|_| BikeError::Timeout {
                timeout_ms: params.timeout_ms,
            })?
            .map_err(|e| BikeError::ConnectionFailed(e.to_string()))?;

        let adapter = self.adapter().await?;
        let mut central_events = adapter.events().await?;
        let peripheral_id = peripheral.id();
        let events = self.events_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        info!("Bike disconnected");
                        let _ = events.send(TransportEvent::Disconnected);
                        break;
                    }
                }
            }
        }));

        info!("Controller connected");
        Ok(())
    }

    async fn discover_service(&mut self) -> Result<()> {
        let peripheral = self.peripheral()?;
        peripheral.discover_services().await?;

        let service_uuid = parse_uuid(DOMYOS_SERVICE_UUID, "service")?;
        if peripheral.services().iter().any(|s| s.uuid == service_uuid) {
            debug!("Communication service discovered");
            Ok(())
        } else {
            Err(BikeError::ServiceNotFound)
        }
    }

    async fn bind_characteristics(&mut self) -> Result<()> {
        let service_uuid = parse_uuid(DOMYOS_SERVICE_UUID, "service")?;
        let write_uuid = parse_uuid(DOMYOS_WRITE_CHAR_UUID, "write characteristic")?;
        let notify_uuid = parse_uuid(DOMYOS_NOTIFY_CHAR_UUID, "notify characteristic")?;

        let peripheral = self.peripheral()?.clone();
        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service_uuid)
            .ok_or(BikeError::ServiceNotFound)?;

        let find = |uuid: Uuid, what: &str| {
            service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| BikeError::CharacteristicNotFound(what.to_string()))
        };
        let write_char = find(write_uuid, "write")?;
        let notify_char = find(notify_uuid, "notify")?;

        peripheral.subscribe(&notify_char).await?;
        let mut notifications = peripheral.notifications().await?;
        let events = self.events_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != notify_uuid {
                    continue;
                }
                if events
                    .send(TransportEvent::Notification(Bytes::from(notification.value)))
                    .is_err()
                {
                    return;
                }
            }
            let _ = events.send(TransportEvent::Disconnected);
        }));

        self.write_char = Some(write_char);
        debug!("Subscribed to notifications");
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let peripheral = self.peripheral()?;
        let write_char = self
            .write_char
            .as_ref()
            .ok_or_else(|| BikeError::CharacteristicNotFound("write".to_string()))?;
        peripheral
            .write(write_char, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stop_forwarding();
        self.write_char = None;
        if let Some(peripheral) = &self.peripheral {
            if peripheral.is_connected().await.unwrap_or(false) {
                peripheral.disconnect().await?;
            }
        }
        Ok(())
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
