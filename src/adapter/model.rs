use serde::Serialize;
use strum_macros::Display;

/// Power state reported by the BLE adapter.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterPowerState {
    #[strum(to_string = "powered_on")]
    PoweredOn,
    #[strum(to_string = "powered_off")]
    PoweredOff,
    #[strum(to_string = "unknown")]
    Unknown,
}

impl AdapterPowerState {
    #[must_use]
    pub fn is_on(self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

/// Events pushed by the adapter, in delivery order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AdapterEvent {
    AdapterStateChanged {
        powered_on: bool,
    },
    PeripheralDiscovered {
        id: String,
        name: Option<String>,
        rssi: Option<i16>,
    },
    ScanStopped,
    PeripheralDisconnected {
        id: String,
        reason: Option<String>,
    },
    CharacteristicValueUpdated {
        id: String,
        service_id: String,
        characteristic_id: String,
        value: Vec<u8>,
    },
}

/// A characteristic description discovered on a connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CharacteristicInfo {
    uuid: String,
    properties: Vec<String>,
}

impl CharacteristicInfo {
    /// Creates a characteristic description.
    ///
    /// Property labels follow the lower-case GATT names, e.g. `write`,
    /// `write_without_response`, `notify`, `indicate`.
    #[must_use]
    pub fn new(uuid: impl Into<String>, properties: Vec<String>) -> Self {
        Self {
            uuid: uuid.into().to_ascii_lowercase(),
            properties,
        }
    }

    /// Returns the characteristic UUID.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns property labels for this characteristic.
    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    pub(crate) fn has_property(&self, property: &str) -> bool {
        self.properties
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(property))
    }

    pub(crate) fn supports_write(&self) -> bool {
        self.has_property("write") || self.has_property("write_without_response")
    }

    pub(crate) fn supports_notify(&self) -> bool {
        self.has_property("notify") || self.has_property("indicate")
    }
}

/// A GATT service with discovered characteristics.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ServiceInfo {
    uuid: String,
    characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    /// Creates a service description.
    #[must_use]
    pub fn new(uuid: impl Into<String>, characteristics: Vec<CharacteristicInfo>) -> Self {
        Self {
            uuid: uuid.into().to_ascii_lowercase(),
            characteristics,
        }
    }

    /// Returns the service UUID.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns all characteristics in this service.
    #[must_use]
    pub fn characteristics(&self) -> &[CharacteristicInfo] {
        &self.characteristics
    }

    pub(crate) fn characteristic(&self, uuid: &str) -> Option<&CharacteristicInfo> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid().eq_ignore_ascii_case(uuid))
    }
}
