mod btleplug_backend;
mod fake_backend;
mod model;

use std::fmt::Debug;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::Stream;

pub use self::btleplug_backend::BtleplugAdapter;
pub use self::fake_backend::{
    FakeAdapter, FakeAdapterConfig, FakeAdapterHandle, FakeCall, FakeOperation, FakePeripheral,
    ResponseScript, ScanFixture,
};
pub use self::model::{AdapterEvent, AdapterPowerState, CharacteristicInfo, ServiceInfo};
use crate::error::AdapterError;

/// Events delivered by an adapter after [`BleAdapter::start`].
pub type AdapterEventStream = Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

/// The BLE primitives a session drives. Implementations own GATT framing;
/// identifiers are the adapter's own string ids.
#[async_trait]
pub trait BleAdapter: Send + Sync + Debug {
    /// Starts the adapter and hands out its event stream. Called once.
    async fn start(&self) -> Result<AdapterEventStream, AdapterError>;

    /// Returns the current power state.
    async fn check_adapter_state(&self) -> Result<AdapterPowerState, AdapterError>;

    /// Reports whether the process may use Bluetooth.
    async fn permissions_granted(&self) -> Result<bool, AdapterError> {
        Ok(true)
    }

    /// Starts scanning. The adapter emits [`AdapterEvent::ScanStopped`] once
    /// `duration` elapses or the scan is stopped.
    async fn scan(
        &self,
        service_filters: &[String],
        duration: Duration,
        allow_duplicates: bool,
    ) -> Result<(), AdapterError>;

    async fn stop_scan(&self) -> Result<(), AdapterError>;

    async fn connect(&self, id: &str) -> Result<(), AdapterError>;

    async fn disconnect(&self, id: &str) -> Result<(), AdapterError>;

    /// Discovers and returns every service with its characteristics.
    async fn retrieve_services(&self, id: &str) -> Result<Vec<ServiceInfo>, AdapterError>;

    async fn write(
        &self,
        id: &str,
        service_id: &str,
        characteristic_id: &str,
        payload: &[u8],
    ) -> Result<(), AdapterError>;

    async fn write_without_response(
        &self,
        id: &str,
        service_id: &str,
        characteristic_id: &str,
        payload: &[u8],
    ) -> Result<(), AdapterError>;

    /// Enables notifications; values arrive as
    /// [`AdapterEvent::CharacteristicValueUpdated`].
    async fn subscribe_notifications(
        &self,
        id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), AdapterError>;

    async fn unsubscribe_notifications(
        &self,
        id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), AdapterError>;
}
