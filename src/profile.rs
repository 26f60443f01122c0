use serde::Serialize;
use serde_with::SerializeDisplay;
use tracing::{debug, instrument};

use crate::adapter::{CharacteristicInfo, ServiceInfo};

const BLUETOOTH_BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

/// How commands are written to the adapter's write characteristic.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, derive_more::Display, SerializeDisplay)]
pub enum WriteMode {
    /// GATT write request, acknowledged by the peripheral.
    #[display("with_ack")]
    WithAck,
    /// GATT write command, no acknowledgement.
    #[display("no_ack")]
    NoAck,
}

impl WriteMode {
    /// Picks the write mode advertised by a characteristic, preferring
    /// unacknowledged writes.
    pub(crate) fn for_characteristic(characteristic: &CharacteristicInfo) -> Option<Self> {
        if characteristic.has_property("write_without_response") {
            Some(Self::NoAck)
        } else if characteristic.has_property("write") {
            Some(Self::WithAck)
        } else {
            None
        }
    }
}

/// One known `(service, write, notify)` layout used by ELM327 BLE adapters.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DeviceProfile {
    label: String,
    service_uuid: String,
    write_uuid: String,
    notify_uuid: String,
}

impl DeviceProfile {
    /// Creates a profile. 16- and 32-bit short UUIDs are expanded onto the
    /// Bluetooth base UUID.
    ///
    /// ```
    /// let profile = elmble::DeviceProfile::new("generic", "fff0", "fff2", "fff1");
    /// assert_eq!("0000fff0-0000-1000-8000-00805f9b34fb", profile.service_uuid());
    /// ```
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        service_uuid: &str,
        write_uuid: &str,
        notify_uuid: &str,
    ) -> Self {
        Self {
            label: label.into(),
            service_uuid: normalise_uuid(service_uuid),
            write_uuid: normalise_uuid(write_uuid),
            notify_uuid: normalise_uuid(notify_uuid),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn service_uuid(&self) -> &str {
        &self.service_uuid
    }

    #[must_use]
    pub fn write_uuid(&self) -> &str {
        &self.write_uuid
    }

    #[must_use]
    pub fn notify_uuid(&self) -> &str {
        &self.notify_uuid
    }

    fn resolve(&self, services: &[ServiceInfo]) -> Option<ActiveProfile> {
        let service = services
            .iter()
            .find(|service| service.uuid().eq_ignore_ascii_case(&self.service_uuid))?;
        let write_characteristic = service
            .characteristic(&self.write_uuid)
            .filter(|characteristic| characteristic.supports_write())?;
        let notify_characteristic = service
            .characteristic(&self.notify_uuid)
            .filter(|characteristic| characteristic.supports_notify())?;
        let write_mode = WriteMode::for_characteristic(write_characteristic)?;

        Some(ActiveProfile {
            label: self.label.clone(),
            service_id: service.uuid().to_string(),
            write_characteristic_id: write_characteristic.uuid().to_string(),
            notify_characteristic_id: notify_characteristic.uuid().to_string(),
            write_mode,
        })
    }
}

/// Ordered list of profiles tried against a connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ProfileCatalog {
    profiles: Vec<DeviceProfile>,
}

impl ProfileCatalog {
    /// Creates a catalog that is searched in the given order.
    #[must_use]
    pub fn new(profiles: Vec<DeviceProfile>) -> Self {
        Self { profiles }
    }

    #[must_use]
    pub fn profiles(&self) -> &[DeviceProfile] {
        &self.profiles
    }

    /// Returns the first profile, in catalog order, whose service and both
    /// characteristics are present with usable properties.
    #[instrument(skip_all, level = "debug", fields(service_count = services.len()))]
    #[must_use]
    pub fn match_services(&self, services: &[ServiceInfo]) -> Option<ActiveProfile> {
        for profile in &self.profiles {
            if let Some(active) = profile.resolve(services) {
                debug!(profile = profile.label(), write_mode = %active.write_mode, "matched device profile");
                return Some(active);
            }
        }
        None
    }
}

impl Default for ProfileCatalog {
    fn default() -> Self {
        Self::new(vec![
            DeviceProfile::new("generic_fff0", "fff0", "fff2", "fff1"),
            DeviceProfile::new("hm10_ffe0", "ffe0", "ffe1", "ffe1"),
            DeviceProfile::new("vgate_18f0", "18f0", "2af1", "2af0"),
            DeviceProfile::new(
                "obdlink_e781",
                "e7810a71-73ae-499d-8c15-faa9aef0c3f2",
                "bef8d6c9-9c21-4c9e-b632-bd58c1009f9f",
                "bef8d6c9-9c21-4c9e-b632-bd58c1009f9f",
            ),
        ])
    }
}

/// The profile negotiated for the current connection.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ActiveProfile {
    label: String,
    service_id: String,
    write_characteristic_id: String,
    notify_characteristic_id: String,
    write_mode: WriteMode,
}

impl ActiveProfile {
    /// Catalog label of the matched profile.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    #[must_use]
    pub fn write_characteristic_id(&self) -> &str {
        &self.write_characteristic_id
    }

    #[must_use]
    pub fn notify_characteristic_id(&self) -> &str {
        &self.notify_characteristic_id
    }

    #[must_use]
    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    pub(crate) fn is_notify_source(&self, service_id: &str, characteristic_id: &str) -> bool {
        self.notify_characteristic_id
            .eq_ignore_ascii_case(characteristic_id)
            && (service_id.is_empty() || self.service_id.eq_ignore_ascii_case(service_id))
    }
}

/// Expands short UUIDs onto the Bluetooth base UUID and lower-cases the rest.
pub(crate) fn normalise_uuid(uuid: &str) -> String {
    let trimmed = uuid.trim().to_ascii_lowercase();
    let is_hex = trimmed.chars().all(|c| c.is_ascii_hexdigit());
    match trimmed.len() {
        4 if is_hex => format!("0000{trimmed}{BLUETOOTH_BASE_UUID_SUFFIX}"),
        8 if is_hex => format!("{trimmed}{BLUETOOTH_BASE_UUID_SUFFIX}"),
        _ => trimmed,
    }
}
