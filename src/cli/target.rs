use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tracing::{debug, info, instrument};

use crate::error::CliRunError;
use crate::profile::ActiveProfile;
use crate::session::Session;
use crate::store::{AggregateState, DiscoveredDevice};

use super::command::parse_duration;
use super::ui::Spinner;

const DEFAULT_TARGET_SCAN: Duration = Duration::from_secs(5);

/// Selects the adapter a command talks to.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Device id to connect to. Without it, the strongest likely ELM327
    /// adapter found by the scan is used.
    #[arg(long)]
    device: Option<String>,
    /// How long to scan for the target.
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    scan_duration: Duration,
}

impl TargetArgs {
    /// Targets a specific device id.
    #[must_use]
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device: Some(device_id.into()),
            scan_duration: DEFAULT_TARGET_SCAN,
        }
    }

    /// Overrides how long to scan for the target.
    #[must_use]
    pub fn with_scan_duration(mut self, scan_duration: Duration) -> Self {
        self.scan_duration = scan_duration;
        self
    }
}

impl Default for TargetArgs {
    fn default() -> Self {
        Self {
            device: None,
            scan_duration: DEFAULT_TARGET_SCAN,
        }
    }
}

/// Scans for the target and connects to it.
///
/// With an explicit device the scan ends as soon as it is seen; connecting
/// supersedes the scan still running in the session.
#[instrument(skip_all, level = "info", fields(device = target.device.as_deref()))]
pub(crate) async fn connect(
    session: &Session,
    target: &TargetArgs,
    spinner: &Spinner,
) -> Result<(String, ActiveProfile)> {
    let device_id = spinner
        .run("Scanning for ELM327 adapters", find(session, target))
        .await?;

    info!(%device_id, "connecting to target");
    let profile = spinner
        .run(format!("Connecting to {device_id}"), session.connect(&device_id))
        .await?;
    Ok((device_id, profile))
}

async fn find(session: &Session, target: &TargetArgs) -> Result<String> {
    let mut state = session.watch_state();
    state.mark_unchanged();
    let scan = session.scan(target.scan_duration);
    tokio::pin!(scan);

    loop {
        tokio::select! {
            result = &mut scan => {
                result?;
                return select(&session.state(), target.device.as_deref());
            }
            changed = state.changed(), if target.device.is_some() => {
                changed?;
                let seen = target
                    .device
                    .as_deref()
                    .is_some_and(|id| state.borrow_and_update().discovered_device(id).is_some());
                if seen {
                    debug!("target seen; ending scan early");
                    return select(&session.state(), target.device.as_deref());
                }
            }
        }
    }
}

/// Picks the requested device, or the strongest likely-compatible one.
pub(crate) fn select(state: &AggregateState, device_id: Option<&str>) -> Result<String> {
    if let Some(device_id) = device_id {
        return match state.discovered_device(device_id) {
            Some(device) => Ok(device.id().to_string()),
            None => Err(CliRunError::DeviceNotFound {
                device_id: device_id.to_string(),
            }
            .into()),
        };
    }

    state
        .discovered_devices()
        .filter(|device| device.likely_compatible())
        .max_by_key(|device| device.rssi().unwrap_or(i16::MIN))
        .map(DiscoveredDevice::id)
        .map(str::to_string)
        .ok_or_else(|| {
            CliRunError::NoCompatibleDevice {
                seen: state.discovered_devices().count(),
            }
            .into()
        })
}
