use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tracing::{Instrument, debug, info, info_span, trace, warn};

use super::Reply;
use super::actor::SessionActor;
use crate::adapter::{BleAdapter, ServiceInfo};
use crate::error::{ElmError, ErrorClass};
use crate::profile::{ActiveProfile, ProfileCatalog};
use crate::store::{ConnectionState, DiscoveredDevice, StateEvent};

/// A running scan and the caller waiting for it.
#[derive(Debug)]
pub(super) struct ActiveScan {
    deadline: Instant,
    reply: Reply<()>,
}

impl ActiveScan {
    pub(super) fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Why a scan ended. Every path converges on [`SessionActor::finish_scan`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(super) enum ScanEnd {
    /// The adapter reported the scan stopped.
    Adapter,
    Deadline,
    /// A connect request needs the radio.
    Superseded,
    AdapterOff,
    Closed,
}

#[derive(Debug)]
pub(super) struct PendingConnect {
    device_id: String,
    reply: Reply<ActiveProfile>,
}

/// Result of a background connection attempt.
#[derive(Debug)]
pub(super) struct ConnectOutcome {
    device_id: String,
    result: Result<ActiveProfile, ElmError>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(super) enum TeardownOrigin {
    /// The caller asked to disconnect.
    Local,
    /// The adapter reported the link gone.
    Remote,
}

impl SessionActor {
    pub(super) async fn start_scan(&mut self, duration: Duration, reply: Reply<()>) {
        self.apply(StateEvent::ErrorsCleared(ErrorClass::Scan));

        let state = self.snapshot();
        let precondition = if !state.is_bluetooth_on() {
            Err(ElmError::AdapterOff)
        } else if !state.has_permissions() {
            Err(ElmError::PermissionMissing)
        } else if state.connection() != ConnectionState::Idle {
            Err(ElmError::ScanRejected {
                state: state.connection(),
            })
        } else {
            Ok(())
        };
        if let Err(error) = precondition {
            Self::reply(reply, Err(self.record(ErrorClass::Scan, error)));
            return;
        }

        self.apply(StateEvent::ScanStarted);
        let started = self
            .adapter
            .scan(
                &self.config.scan_service_filters,
                duration,
                self.config.allow_duplicates,
            )
            .await;
        if let Err(source) = started {
            self.apply(StateEvent::ScanStopped);
            let error = self.record(ErrorClass::Scan, ElmError::Scan { source });
            Self::reply(reply, Err(error));
            return;
        }

        info!(?duration, "scan started");
        self.scan = Some(ActiveScan {
            deadline: Instant::now() + duration,
            reply,
        });
    }

    pub(super) fn discover(&self, id: String, name: Option<String>, rssi: Option<i16>) {
        if self.scan.is_none() {
            trace!(%id, "ignoring advertisement outside a scan");
            return;
        }

        let device =
            DiscoveredDevice::classify(id, name, rssi, &self.config.compatible_keywords);
        debug!(
            id = device.id(),
            name = device.name(),
            rssi = device.rssi(),
            likely_compatible = device.likely_compatible(),
            "device discovered"
        );
        self.apply(StateEvent::DeviceDiscovered(device));
    }

    /// Ends the running scan, if any, and answers its caller.
    pub(super) async fn finish_scan(&mut self, end: ScanEnd) {
        let Some(scan) = self.scan.take() else {
            return;
        };

        if matches!(end, ScanEnd::Superseded | ScanEnd::Closed) {
            if let Err(error) = self.adapter.stop_scan().await {
                warn!(%error, "failed to stop scan; continuing");
            }
        }

        self.apply(StateEvent::ScanStopped);
        info!(
            ?end,
            devices = self.snapshot().discovered_devices().count(),
            "scan finished"
        );

        let result = match end {
            ScanEnd::AdapterOff => Err(self.record(ErrorClass::Scan, ElmError::AdapterOff)),
            ScanEnd::Closed => Err(ElmError::SessionClosed),
            ScanEnd::Adapter | ScanEnd::Deadline | ScanEnd::Superseded => Ok(()),
        };
        Self::reply(scan.reply, result);
    }

    pub(super) async fn start_connect(&mut self, device_id: String, reply: Reply<ActiveProfile>) {
        self.apply(StateEvent::ErrorsCleared(ErrorClass::Connect));

        let state = self.snapshot();
        match state.connection() {
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                let error = ElmError::ConnectRejected {
                    device_id,
                    state: state.connection(),
                };
                Self::reply(reply, Err(self.record(ErrorClass::Connect, error)));
                return;
            }
            ConnectionState::Connected => {
                let connected = state.connected_device_id().unwrap_or_default();
                let result = match state.active_profile() {
                    Some(profile) if connected == device_id => {
                        debug!(%device_id, "already connected");
                        Ok(profile.clone())
                    }
                    _ => Err(self.record(
                        ErrorClass::Connect,
                        ElmError::ConnectedToOtherDevice {
                            connected: connected.to_string(),
                            requested: device_id,
                        },
                    )),
                };
                Self::reply(reply, result);
                return;
            }
            ConnectionState::Scanning => self.finish_scan(ScanEnd::Superseded).await,
            ConnectionState::Idle => {}
        }

        if !self.snapshot().is_bluetooth_on() {
            Self::reply(reply, Err(self.record(ErrorClass::Connect, ElmError::AdapterOff)));
            return;
        }

        info!(%device_id, "connecting");
        self.apply(StateEvent::ConnectStarted {
            device_id: device_id.clone(),
        });

        let adapter = Arc::clone(&self.adapter);
        let catalog = self.config.catalog.clone();
        let outcomes = self.outcomes.clone();
        let attempt_id = device_id.clone();
        tokio::spawn(
            async move {
                let result = establish(adapter.as_ref(), &catalog, &attempt_id).await;
                let outcome = ConnectOutcome {
                    device_id: attempt_id,
                    result,
                };
                if outcomes.send(outcome).is_err() {
                    debug!("session stopped before the connection attempt finished");
                }
            }
            .instrument(info_span!("connect", %device_id)),
        );

        self.connect = Some(PendingConnect { device_id, reply });
    }

    pub(super) async fn finish_connect(&mut self, outcome: ConnectOutcome) {
        let ConnectOutcome { device_id, result } = outcome;
        let Some(pending) = self
            .connect
            .take_if(|pending| pending.device_id == device_id)
        else {
            if let Ok(profile) = result {
                debug!(%device_id, "releasing connection nobody is waiting for");
                release(self.adapter.as_ref(), &device_id, Some(&profile)).await;
            }
            return;
        };

        match result {
            Ok(profile) => {
                self.reset_correlator();
                self.apply(StateEvent::ConnectSucceeded {
                    device_id: device_id.clone(),
                    profile: profile.clone(),
                });
                info!(%device_id, profile = profile.label(), write_mode = %profile.write_mode(), "connected");
                Self::reply(pending.reply, Ok(profile));
            }
            Err(error) => {
                warn!(%device_id, %error, "connection attempt failed");
                self.apply(StateEvent::ConnectFailed);
                Self::reply(pending.reply, Err(self.record(ErrorClass::Connect, error)));
            }
        }
    }

    /// Gives up on a running connection attempt and releases the device if
    /// the attempt still succeeds shortly after.
    pub(super) async fn abandon_connect(
        &mut self,
        outcomes: &mut mpsc::UnboundedReceiver<ConnectOutcome>,
    ) {
        let Some(pending) = self.connect.take() else {
            return;
        };
        self.apply(StateEvent::ConnectFailed);
        Self::reply(pending.reply, Err(ElmError::SessionClosed));

        match timeout(self.config.command_timeout, outcomes.recv()).await {
            Ok(Some(ConnectOutcome {
                device_id,
                result: Ok(profile),
            })) => release(self.adapter.as_ref(), &device_id, Some(&profile)).await,
            Ok(_) => {}
            Err(_elapsed) => {
                warn!(device_id = %pending.device_id, "connection attempt still running at close");
            }
        }
    }

    /// Tears down the current connection. Both origins cancel the pending
    /// command and clear per-connection state; only a local teardown talks
    /// to the adapter.
    pub(super) async fn teardown(&mut self, origin: TeardownOrigin) -> Result<(), ElmError> {
        let state = self.snapshot();
        let (Some(device_id), Some(profile)) = (
            state.connected_device_id().map(str::to_string),
            state.active_profile().cloned(),
        ) else {
            return Ok(());
        };

        if origin == TeardownOrigin::Local {
            self.apply(StateEvent::ErrorsCleared(ErrorClass::Disconnect));
        }
        self.apply(StateEvent::DisconnectStarted);
        self.cancel_command();

        let mut result = Ok(());
        match origin {
            TeardownOrigin::Local => {
                if let Err(error) = self
                    .adapter
                    .unsubscribe_notifications(
                        &device_id,
                        profile.service_id(),
                        profile.notify_characteristic_id(),
                    )
                    .await
                {
                    warn!(%device_id, %error, "failed to unsubscribe notifications; disconnecting anyway");
                }
                if let Err(source) = self.adapter.disconnect(&device_id).await {
                    let error = ElmError::Disconnection {
                        device_id: device_id.clone(),
                        source,
                    };
                    result = Err(self.record(ErrorClass::Disconnect, error));
                }
            }
            TeardownOrigin::Remote => {
                debug!(%device_id, "link already gone; skipping adapter teardown");
            }
        }

        self.apply(StateEvent::Disconnected);
        info!(%device_id, ?origin, "disconnected");
        result
    }

    pub(super) async fn remote_teardown(&mut self) {
        if let Err(error) = self.teardown(TeardownOrigin::Remote).await {
            debug!(%error, "remote teardown failed");
        }
    }
}

/// Connects, discovers services, matches a profile and subscribes to its
/// notify characteristic. Any failure after the link is up releases it.
async fn establish(
    adapter: &dyn BleAdapter,
    catalog: &ProfileCatalog,
    device_id: &str,
) -> Result<ActiveProfile, ElmError> {
    let connection_error = |source| ElmError::Connection {
        device_id: device_id.to_string(),
        source,
    };

    adapter.connect(device_id).await.map_err(connection_error)?;

    let services = match adapter.retrieve_services(device_id).await {
        Ok(services) => services,
        Err(source) => {
            release(adapter, device_id, None).await;
            return Err(connection_error(source));
        }
    };

    let Some(profile) = catalog.match_services(&services) else {
        release(adapter, device_id, None).await;
        return Err(ElmError::IncompatibleDevice {
            device_id: device_id.to_string(),
            services: describe_services(&services),
        });
    };

    if let Err(source) = adapter
        .subscribe_notifications(
            device_id,
            profile.service_id(),
            profile.notify_characteristic_id(),
        )
        .await
    {
        release(adapter, device_id, None).await;
        return Err(connection_error(source));
    }

    Ok(profile)
}

/// Best-effort cleanup of a link the session will not keep.
async fn release(adapter: &dyn BleAdapter, device_id: &str, profile: Option<&ActiveProfile>) {
    if let Some(profile) = profile {
        if let Err(error) = adapter
            .unsubscribe_notifications(
                device_id,
                profile.service_id(),
                profile.notify_characteristic_id(),
            )
            .await
        {
            debug!(%device_id, %error, "failed to unsubscribe during release");
        }
    }
    if let Err(error) = adapter.disconnect(device_id).await {
        warn!(%device_id, %error, "failed to release device");
    }
}

fn describe_services(services: &[ServiceInfo]) -> String {
    if services.is_empty() {
        return "none".to_string();
    }
    services
        .iter()
        .map(ServiceInfo::uuid)
        .collect::<Vec<_>>()
        .join(", ")
}
