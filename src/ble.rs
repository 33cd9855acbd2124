use async_trait::async_trait;
use btleplug::{
    api::{BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex,
    },
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::ConnectionParams,
    error::{Result, TrainerError},
    protocol::{FrameSource, OutgoingCommand, RawFrame},
    session::CommandTransport,
    types::DeviceInfo,
    TRAINER_NAME_PREFIXES, TRAINER_REP_CHAR_UUID, TRAINER_RX_CHAR_UUID, TRAINER_SERVICE_UUID,
    TRAINER_TX_CHAR_UUID,
};

fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| TrainerError::Protocol(format!("Invalid {what} UUID: {e}")))
}

/// Whether an advertised name belongs to a supported trainer
#[must_use]
pub fn is_trainer_name(name: &str) -> bool {
    TRAINER_NAME_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Which frame stream a notifying characteristic carries
#[must_use]
pub fn frame_source(characteristic: Uuid) -> Option<FrameSource> {
    if Uuid::parse_str(TRAINER_TX_CHAR_UUID).is_ok_and(|tx| tx == characteristic) {
        Some(FrameSource::Sample)
    } else if Uuid::parse_str(TRAINER_REP_CHAR_UUID).is_ok_and(|reps| reps == characteristic) {
        Some(FrameSource::Reps)
    } else {
        None
    }
}

/// BLE manager for trainer discovery and connection
pub struct BleManager {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<BDAddr, Peripheral>>>,
}

impl BleManager {
    /// Create a new BLE manager
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Ble`] if the Bluetooth adapter cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Scan for trainers
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::DeviceNotFound`] if no Bluetooth adapters are available,
    /// or [`TrainerError::Ble`] for other Bluetooth-related errors.
    pub async fn scan_for_devices(&self, params: &ConnectionParams) -> Result<Vec<DeviceInfo>> {
        info!("Starting scan for trainers...");

        let adapters = self.manager.adapters().await?;
        let central = adapters.first().ok_or(TrainerError::DeviceNotFound)?;

        let scan_filter = ScanFilter {
            services: vec![parse_uuid(TRAINER_SERVICE_UUID, "service")?],
        };
        central.start_scan(scan_filter).await?;
        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;
        central.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in central.peripherals().await? {
            let Some(device_info) = Self::trainer_info(&peripheral).await else {
                continue;
            };
            info!("Found trainer: {} (rssi {})", device_info.name, device_info.rssi);
            devices.push(device_info);
            self.peripherals
                .lock()
                .await
                .insert(peripheral.address(), peripheral);
        }

        info!("Scan completed. Found {} trainer(s)", devices.len());
        Ok(devices)
    }

    /// Connect to a device found by a previous scan
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::DeviceNotFound`] if the device was not seen in a scan,
    /// [`TrainerError::Timeout`] if connection times out,
    /// [`TrainerError::ConnectionFailed`] if connection fails,
    /// or [`TrainerError::Protocol`] if the expected service is missing.
    pub async fn connect_to_device(
        &self,
        device_info: &DeviceInfo,
        params: &ConnectionParams,
    ) -> Result<TrainerConnection> {
        info!("Connecting to trainer: {}", device_info.name);

        let peripheral = self.find_peripheral(device_info).await?;

        timeout(Duration::from_millis(params.timeout_ms), peripheral.connect())
            .await
            .map_err(|_| TrainerError::Timeout {
                timeout_ms: params.timeout_ms,
            })?
            .map_err(|e| TrainerError::ConnectionFailed(e.to_string()))?;

        peripheral.discover_services().await?;

        let service_uuid = parse_uuid(TRAINER_SERVICE_UUID, "service")?;
        let services = peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == service_uuid)
            .ok_or_else(|| TrainerError::Protocol("Trainer service not found".to_string()))?;

        let find = |uuid: &str, what: &str| -> Result<Characteristic> {
            let uuid = parse_uuid(uuid, what)?;
            service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| TrainerError::Protocol(format!("{what} characteristic not found")))
        };

        let rx_char = find(TRAINER_RX_CHAR_UUID, "RX")?;
        let tx_char = find(TRAINER_TX_CHAR_UUID, "TX")?;
        let rep_char = find(TRAINER_REP_CHAR_UUID, "rep")?;

        peripheral.subscribe(&tx_char).await?;
        peripheral.subscribe(&rep_char).await?;

        info!("Successfully connected to {}", device_info.name);

        Ok(TrainerConnection {
            peripheral,
            rx_char,
            command_timeout_ms: params.command_timeout_ms,
        })
    }

    async fn find_peripheral(&self, device_info: &DeviceInfo) -> Result<Peripheral> {
        let peripherals = self.peripherals.lock().await;

        if let Some(address) = &device_info.address {
            if let Some(peripheral) = peripherals
                .values()
                .find(|p| p.address().to_string() == *address)
            {
                return Ok(peripheral.clone());
            }
        }

        for peripheral in peripherals.values() {
            if let Ok(Some(properties)) = peripheral.properties().await {
                if properties.local_name.as_ref() == Some(&device_info.name) {
                    return Ok(peripheral.clone());
                }
            }
        }

        Err(TrainerError::DeviceNotFound)
    }

    async fn trainer_info(peripheral: &Peripheral) -> Option<DeviceInfo> {
        let properties = peripheral.properties().await.ok()??;
        let name = properties.local_name?;
        if !is_trainer_name(&name) {
            return None;
        }

        Some(
            DeviceInfo::new(name, properties.rssi.unwrap_or(i16::MIN))
                .with_address(properties.address.to_string()),
        )
    }
}

/// Active connection to a trainer
pub struct TrainerConnection {
    peripheral: Peripheral,
    rx_char: Characteristic,
    command_timeout_ms: u64,
}

impl TrainerConnection {
    /// Forward sample and rep notifications into `sender`
    ///
    /// Frames arriving while the channel is full are dropped. The returned
    /// task ends when the notification stream or the channel closes.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Ble`] if the notification stream cannot be opened.
    pub async fn start_notifications(
        &self,
        sender: mpsc::Sender<RawFrame>,
    ) -> Result<JoinHandle<()>> {
        let mut notifications = self.peripheral.notifications().await?;

        Ok(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let Some(source) = frame_source(notification.uuid) else {
                    continue;
                };
                let frame = RawFrame {
                    source,
                    data: notification.value.into(),
                };
                match sender.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!(?source, "telemetry channel full; dropping frame");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            debug!("notification stream ended");
        }))
    }

    /// Check if the device is still connected
    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    /// Disconnect from the device
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Ble`] if disconnection fails.
    pub async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    /// Get device address
    #[must_use]
    pub fn address(&self) -> BDAddr {
        self.peripheral.address()
    }
}

#[async_trait]
impl CommandTransport for TrainerConnection {
    async fn send(&self, command: &OutgoingCommand) -> Result<()> {
        let opcode = command.opcode();
        debug!("Sending {opcode}: {:02X?}", command.as_bytes());

        timeout(
            Duration::from_millis(self.command_timeout_ms),
            self.peripheral
                .write(&self.rx_char, command.as_bytes(), WriteType::WithoutResponse),
        )
        .await
        .map_err(|_| {
            warn!("{opcode} write timed out");
            TrainerError::Timeout {
                timeout_ms: self.command_timeout_ms,
            }
        })?
        .map_err(|e| TrainerError::Transport {
            opcode: opcode.to_string(),
            reason: e.to_string(),
        })
    }
}
