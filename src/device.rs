use crate::{
    ble::{BleManager, TrainerConnection},
    config::TrainerConfig,
    coordinator::SessionCoordinator,
    error::{Result, TrainerError},
    session::{spawn_session, SessionHandle, WorkoutRepository, WorkoutSession},
    types::{ConnectionState, DeviceInfo},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Main interface to a connected cable trainer
///
/// `TrainerDevice` wires a BLE connection to a running [`WorkoutSession`]:
/// notifications feed the session's telemetry channel, the session sends its
/// commands over the connection, and a monitor task publishes link loss to
/// the shared [`SessionCoordinator`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use cablelift::{mocks::InMemoryRepository, TrainerDevice, WorkoutParameters};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let trainer = TrainerDevice::connect_first(Arc::new(InMemoryRepository::new())).await?;
///
///     let params = WorkoutParameters {
///         target_reps: 8,
///         weight_per_cable_kg: 20.0,
///         ..Default::default()
///     };
///     trainer.session().start_workout(params, false).await?;
///
///     // ... lift ...
///
///     trainer.session().stop(false).await?;
///     trainer.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct TrainerDevice {
    connection: Arc<TrainerConnection>,
    device_info: DeviceInfo,
    coordinator: Arc<SessionCoordinator>,
    session: SessionHandle,
    session_task: JoinHandle<()>,
    notification_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

impl TrainerDevice {
    /// Connect to the strongest trainer in range with default configuration
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::DeviceNotFound`] if no trainer is found during
    /// the scan, or any BLE connection error.
    pub async fn connect_first(repository: Arc<dyn WorkoutRepository>) -> Result<Self> {
        Self::connect_first_with_config(repository, TrainerConfig::default()).await
    }

    /// Connect to the strongest trainer in range
    ///
    /// When several trainers answer the scan, the one with the strongest
    /// signal is chosen.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidConfig`] if `config` fails validation,
    /// [`TrainerError::DeviceNotFound`] if no trainer is found, or any BLE
    /// connection error.
    pub async fn connect_first_with_config(
        repository: Arc<dyn WorkoutRepository>,
        config: TrainerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let ble_manager = BleManager::new().await?;
        let mut devices = ble_manager.scan_for_devices(&config.connection).await?;
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));

        let device_info = devices
            .into_iter()
            .next()
            .ok_or(TrainerError::DeviceNotFound)?;
        Self::connect_with(&ble_manager, device_info, repository, config).await
    }

    /// Connect to a specific trainer
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::DeviceNotFound`] if the trainer does not answer
    /// a scan, or any BLE connection error.
    pub async fn connect_to_device(
        device_info: DeviceInfo,
        repository: Arc<dyn WorkoutRepository>,
        config: TrainerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let ble_manager = BleManager::new().await?;
        ble_manager.scan_for_devices(&config.connection).await?;
        Self::connect_with(&ble_manager, device_info, repository, config).await
    }

    async fn connect_with(
        ble_manager: &BleManager,
        device_info: DeviceInfo,
        repository: Arc<dyn WorkoutRepository>,
        config: TrainerConfig,
    ) -> Result<Self> {
        let coordinator = Arc::new(SessionCoordinator::new());
        coordinator.connection.set(ConnectionState::Connecting);

        let connection = match ble_manager
            .connect_to_device(&device_info, &config.connection)
            .await
        {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                coordinator.connection.set(ConnectionState::Error(e.to_string()));
                return Err(e);
            }
        };
        coordinator
            .connection
            .set(ConnectionState::Connected(device_info.name.clone()));

        let monitor_interval = Duration::from_millis(config.connection.monitor_interval_ms);
        let session = match WorkoutSession::new(
            coordinator.clone(),
            connection.clone(),
            repository,
            config,
        ) {
            Ok(session) => session,
            Err(e) => {
                let _ = connection.disconnect().await;
                return Err(e);
            }
        };
        if let Err(e) = session.restore_last_parameters().await {
            warn!("Could not restore last parameters: {}", e);
        }

        let (session_handle, telemetry_tx, session_task) = spawn_session(session);
        let notification_task = match connection.start_notifications(telemetry_tx).await {
            Ok(task) => task,
            Err(e) => {
                session_task.abort();
                let _ = connection.disconnect().await;
                return Err(e);
            }
        };
        let monitor_task =
            spawn_connection_monitor(connection.clone(), coordinator.clone(), monitor_interval);

        info!("Trainer {} ready", device_info.name);

        Ok(Self {
            connection,
            device_info,
            coordinator,
            session: session_handle,
            session_task,
            notification_task,
            monitor_task,
        })
    }

    /// Get device information
    #[must_use]
    pub const fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    /// Control handle for the workout session
    #[must_use]
    pub const fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Shared session state
    #[must_use]
    pub const fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    /// Check if the trainer is still connected
    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// Stop background tasks and disconnect
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Ble`] if disconnection fails.
    pub async fn disconnect(&self) -> Result<()> {
        self.monitor_task.abort();
        self.notification_task.abort();
        self.connection.disconnect().await?;
        self.coordinator.connection.set(ConnectionState::Disconnected);
        info!("Disconnected from {}", self.device_info.name);
        Ok(())
    }
}

impl Drop for TrainerDevice {
    fn drop(&mut self) {
        self.monitor_task.abort();
        self.notification_task.abort();
        self.session_task.abort();

        let connection = self.connection.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = connection.disconnect().await;
            });
        }
    }
}

/// Anything whose link state can be polled
#[async_trait]
pub(crate) trait LinkProbe: Send + Sync {
    async fn link_up(&self) -> bool;
}

#[async_trait]
impl LinkProbe for TrainerConnection {
    async fn link_up(&self) -> bool {
        self.is_connected().await
    }
}

/// Poll the link and publish its loss to the coordinator
fn spawn_connection_monitor<L>(
    link: Arc<L>,
    coordinator: Arc<SessionCoordinator>,
    interval: Duration,
) -> JoinHandle<()>
where
    L: LinkProbe + 'static,
{
    tokio::spawn(async move {
        info!("Connection monitoring started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            if !link.link_up().await {
                error!("Connection lost");
                coordinator.connection.set(ConnectionState::Disconnected);
                break;
            }
        }

        info!("Connection monitoring stopped");
    })
}
