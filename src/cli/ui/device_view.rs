use std::fmt::{self, Display, Formatter};

use crate::profile::ActiveProfile;
use crate::store::DiscoveredDevice;

use super::painter::Painter;
use super::table::Table;

/// Renders scan results as one table row per device.
pub(crate) struct DeviceListView<'a> {
    devices: &'a [DiscoveredDevice],
    painter: &'a Painter,
}

impl<'a> DeviceListView<'a> {
    pub(crate) fn new(devices: &'a [DiscoveredDevice], painter: &'a Painter) -> Self {
        Self { devices, painter }
    }
}

impl Display for DeviceListView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let compatible = self
            .devices
            .iter()
            .filter(|device| device.likely_compatible())
            .count();
        write!(
            f,
            "{} {}",
            self.painter.heading("Discovered devices:"),
            self.painter
                .muted(format!("({} found, {compatible} likely ELM327)", self.devices.len()))
        )?;

        if self.devices.is_empty() {
            return write!(f, "\n{}", self.painter.attention("no devices found"));
        }

        let rows = self
            .devices
            .iter()
            .map(|device| {
                let compatible = if device.likely_compatible() {
                    self.painter.positive("yes")
                } else {
                    self.painter.muted("no")
                };
                vec![
                    self.painter.value(device.id()),
                    device.name().unwrap_or("<unknown>").to_string(),
                    self.painter.signal(device.rssi()),
                    compatible,
                ]
            })
            .collect();
        let table = Table::grid(["device_id", "name", "rssi", "elm327"], rows);
        write!(f, "\n{table}")
    }
}

/// Renders the device a command connected to and its negotiated profile.
pub(crate) struct ConnectionView<'a> {
    device_id: &'a str,
    profile: &'a ActiveProfile,
    painter: &'a Painter,
}

impl<'a> ConnectionView<'a> {
    pub(crate) fn new(device_id: &'a str, profile: &'a ActiveProfile, painter: &'a Painter) -> Self {
        Self {
            device_id,
            profile,
            painter,
        }
    }
}

impl Display for ConnectionView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let table = Table::key_value(
            self.painter,
            vec![
                ("device_id", self.painter.value(self.device_id)),
                ("profile", self.painter.value(self.profile.label())),
                ("service", self.profile.service_id().to_string()),
                ("write", self.profile.write_characteristic_id().to_string()),
                ("notify", self.profile.notify_characteristic_id().to_string()),
                ("write_mode", self.profile.write_mode().to_string()),
            ],
        );
        write!(f, "{}", self.painter.heading("Connected device:"))?;
        write!(f, "\n{table}")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::store::DEFAULT_COMPATIBLE_KEYWORDS;

    fn device(id: &str, name: Option<&str>, rssi: Option<i16>) -> DiscoveredDevice {
        DiscoveredDevice::classify(
            id,
            name.map(str::to_string),
            rssi,
            &DEFAULT_COMPATIBLE_KEYWORDS,
        )
    }

    #[rstest]
    #[case::compatible(Some("OBDII"), Some(-61), "yes", "-61 dBm")]
    #[case::unnamed(None, None, "no", "<unknown>")]
    fn device_rows_show_compatibility(
        #[case] name: Option<&str>,
        #[case] rssi: Option<i16>,
        #[case] compatible: &str,
        #[case] expected_cell: &str,
    ) {
        let devices = vec![device("AA:BB", name, rssi)];
        let painter = Painter::new(false);
        let rendered = DeviceListView::new(&devices, &painter).to_string();

        let row = rendered
            .lines()
            .find(|line| line.contains("AA:BB"))
            .expect("device row is rendered");
        assert!(row.contains(compatible));
        assert!(row.contains(expected_cell));
    }

    #[test]
    fn empty_scan_says_so() {
        let painter = Painter::new(false);
        let rendered = DeviceListView::new(&[], &painter).to_string();

        assert_eq!(
            "Discovered devices: (0 found, 0 likely ELM327)\nno devices found",
            rendered
        );
    }
}
