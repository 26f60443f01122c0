use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::model::{AdapterEvent, AdapterPowerState, CharacteristicInfo, ServiceInfo};
use super::{AdapterEventStream, BleAdapter};
use crate::error::AdapterError;
use crate::utils::lock;

type EventSender = mpsc::UnboundedSender<AdapterEvent>;

/// [`BleAdapter`] backed by the first `btleplug` adapter on the host.
#[derive(Debug, Clone)]
pub struct BtleplugAdapter {
    adapter: Adapter,
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    events: Mutex<Option<EventSender>>,
    scan_timer: Mutex<Option<CancellationToken>>,
    notification_forwarders: Mutex<HashMap<(String, String), CancellationToken>>,
}

impl Shared {
    fn emit(&self, event: AdapterEvent) {
        if let Some(events) = lock(&self.events).as_ref()
            && events.send(event).is_err()
        {
            trace!("adapter event receiver dropped");
        }
    }
}

impl BtleplugAdapter {
    /// Opens the platform BLE manager and selects its first adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform manager fails or no adapter exists.
    #[instrument(level = "debug")]
    pub async fn new() -> Result<Self, AdapterError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(AdapterError::NoAdapters)?;
        let name = adapter.adapter_info().await?;
        info!(adapter = %name, "using BLE adapter");

        Ok(Self {
            adapter,
            shared: Arc::new(Shared::default()),
        })
    }

    async fn peripheral(&self, id: &str) -> Result<Peripheral, AdapterError> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|peripheral| peripheral.id().to_string() == id)
            .ok_or_else(|| AdapterError::UnknownPeripheral { id: id.to_string() })
    }

    async fn characteristic(
        &self,
        id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(Peripheral, Characteristic), AdapterError> {
        let peripheral = self.peripheral(id).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|characteristic| {
                characteristic
                    .service_uuid
                    .to_string()
                    .eq_ignore_ascii_case(service_id)
                    && characteristic
                        .uuid
                        .to_string()
                        .eq_ignore_ascii_case(characteristic_id)
            })
            .ok_or_else(|| AdapterError::MissingCharacteristic {
                service: service_id.to_string(),
                characteristic: characteristic_id.to_string(),
            })?;
        Ok((peripheral, characteristic))
    }

    async fn write_with_type(
        &self,
        id: &str,
        service_id: &str,
        characteristic_id: &str,
        payload: &[u8],
        write_type: WriteType,
    ) -> Result<(), AdapterError> {
        let (peripheral, characteristic) =
            self.characteristic(id, service_id, characteristic_id).await?;
        peripheral
            .write(&characteristic, payload, write_type)
            .await?;
        Ok(())
    }

    fn stop_notification_forwarders(&self, id: &str) {
        lock(&self.shared.notification_forwarders).retain(|(peripheral_id, _), token| {
            let keep = peripheral_id != id;
            if !keep {
                token.cancel();
            }
            keep
        });
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    #[instrument(skip(self), level = "debug")]
    async fn start(&self) -> Result<AdapterEventStream, AdapterError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut events = lock(&self.shared.events);
            if events.is_some() {
                return Err(AdapterError::EventsAlreadyTaken);
            }
            *events = Some(sender.clone());
        }

        let central_events = self.adapter.events().await?;
        tokio::spawn(forward_central_events(
            self.adapter.clone(),
            central_events,
            sender,
        ));

        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    #[instrument(skip(self), level = "trace")]
    async fn check_adapter_state(&self) -> Result<AdapterPowerState, AdapterError> {
        let state = self.adapter.adapter_state().await?;
        Ok(power_state(state))
    }

    #[instrument(skip(self), level = "debug", fields(?duration, allow_duplicates))]
    async fn scan(
        &self,
        service_filters: &[String],
        duration: Duration,
        allow_duplicates: bool,
    ) -> Result<(), AdapterError> {
        let services = service_filters
            .iter()
            .map(|value| {
                Uuid::parse_str(value).map_err(|source| AdapterError::InvalidUuid {
                    value: value.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if allow_duplicates {
            debug!("btleplug reports every advertisement; duplicate filtering is not configurable");
        }

        self.adapter.start_scan(ScanFilter { services }).await?;

        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.shared.scan_timer).replace(cancel.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = sleep(duration) => {
                    if let Err(error) = adapter.stop_scan().await {
                        debug!(?error, "failed to stop adapter scan cleanly");
                    }
                    shared.emit(AdapterEvent::ScanStopped);
                }
            }
        });

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn stop_scan(&self) -> Result<(), AdapterError> {
        if let Some(timer) = lock(&self.shared.scan_timer).take() {
            timer.cancel();
        }
        self.adapter.stop_scan().await?;
        self.shared.emit(AdapterEvent::ScanStopped);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn connect(&self, id: &str) -> Result<(), AdapterError> {
        let peripheral = self.peripheral(id).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn disconnect(&self, id: &str) -> Result<(), AdapterError> {
        self.stop_notification_forwarders(id);
        let peripheral = self.peripheral(id).await?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn retrieve_services(&self, id: &str) -> Result<Vec<ServiceInfo>, AdapterError> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;
        Ok(collect_services(&peripheral))
    }

    #[instrument(skip(self, payload), level = "trace", fields(payload_len = payload.len()))]
    async fn write(
        &self,
        id: &str,
        service_id: &str,
        characteristic_id: &str,
        payload: &[u8],
    ) -> Result<(), AdapterError> {
        self.write_with_type(
            id,
            service_id,
            characteristic_id,
            payload,
            WriteType::WithResponse,
        )
        .await
    }

    #[instrument(skip(self, payload), level = "trace", fields(payload_len = payload.len()))]
    async fn write_without_response(
        &self,
        id: &str,
        service_id: &str,
        characteristic_id: &str,
        payload: &[u8],
    ) -> Result<(), AdapterError> {
        self.write_with_type(
            id,
            service_id,
            characteristic_id,
            payload,
            WriteType::WithoutResponse,
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn subscribe_notifications(
        &self,
        id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), AdapterError> {
        let (peripheral, characteristic) =
            self.characteristic(id, service_id, characteristic_id).await?;
        peripheral.subscribe(&characteristic).await?;
        let notifications = peripheral.notifications().await?;

        let cancel = CancellationToken::new();
        let key = (id.to_string(), characteristic_id.to_ascii_lowercase());
        if let Some(previous) = lock(&self.shared.notification_forwarders).insert(key, cancel.clone())
        {
            previous.cancel();
        }

        let shared = Arc::clone(&self.shared);
        let id = id.to_string();
        let service_id = service_id.to_ascii_lowercase();
        let expected = characteristic.uuid;
        tokio::spawn(async move {
            let mut notifications = notifications;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    notification = notifications.next() => {
                        let Some(notification) = notification else {
                            debug!(%id, "notification stream closed");
                            break;
                        };
                        if notification.uuid != expected {
                            continue;
                        }
                        shared.emit(AdapterEvent::CharacteristicValueUpdated {
                            id: id.clone(),
                            service_id: service_id.clone(),
                            characteristic_id: notification.uuid.to_string(),
                            value: notification.value,
                        });
                    }
                }
            }
        });

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn unsubscribe_notifications(
        &self,
        id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), AdapterError> {
        let key = (id.to_string(), characteristic_id.to_ascii_lowercase());
        if let Some(forwarder) = lock(&self.shared.notification_forwarders).remove(&key) {
            forwarder.cancel();
        }

        let (peripheral, characteristic) =
            self.characteristic(id, service_id, characteristic_id).await?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }
}

async fn forward_central_events(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn tokio_stream::Stream<Item = CentralEvent> + Send>>,
    events: EventSender,
) {
    while let Some(event) = central_events.next().await {
        let event = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                match discovered(&adapter, &id).await {
                    Some(event) => event,
                    None => continue,
                }
            }
            CentralEvent::DeviceDisconnected(id) => AdapterEvent::PeripheralDisconnected {
                id: id.to_string(),
                reason: None,
            },
            CentralEvent::StateUpdate(state) => AdapterEvent::AdapterStateChanged {
                powered_on: power_state(state).is_on(),
            },
            _ => continue,
        };

        if events.send(event).is_err() {
            debug!("adapter event receiver dropped; stopping central event forwarder");
            break;
        }
    }
}

async fn discovered(adapter: &Adapter, id: &PeripheralId) -> Option<AdapterEvent> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(error) => {
            warn!(%id, ?error, "failed to look up discovered peripheral");
            return None;
        }
    };
    let properties = match peripheral.properties().await {
        Ok(properties) => properties?,
        Err(error) => {
            warn!(%id, ?error, "failed to read peripheral properties");
            return None;
        }
    };

    Some(AdapterEvent::PeripheralDiscovered {
        id: id.to_string(),
        name: properties.local_name,
        rssi: properties.rssi,
    })
}

fn power_state(state: CentralState) -> AdapterPowerState {
    match state {
        CentralState::PoweredOn => AdapterPowerState::PoweredOn,
        CentralState::PoweredOff => AdapterPowerState::PoweredOff,
        CentralState::Unknown => AdapterPowerState::Unknown,
    }
}

fn collect_services(peripheral: &Peripheral) -> Vec<ServiceInfo> {
    let mut services = Vec::new();

    for service in peripheral.services() {
        let mut characteristics: Vec<CharacteristicInfo> = service
            .characteristics
            .iter()
            .map(|characteristic| {
                CharacteristicInfo::new(
                    characteristic.uuid.to_string(),
                    property_labels(characteristic.properties),
                )
            })
            .collect();
        characteristics.sort_by(|left, right| left.uuid().cmp(right.uuid()));

        services.push(ServiceInfo::new(service.uuid.to_string(), characteristics));
    }
    services.sort_by(|left, right| left.uuid().cmp(right.uuid()));

    services
}

fn property_labels(flags: CharPropFlags) -> Vec<String> {
    flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect()
}
