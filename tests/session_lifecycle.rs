mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio::time::Instant;

use common::{
    ADAPTER_ID, catalog_profile, connected, elm_adapter, open, silent, wait_for_state,
};
use elmble::{
    AdapterEvent, CommandOptions, ConnectionState, ElmError, ErrorKind, FakeAdapterConfig, FakeCall, FakePeripheral,
    ResponseScript, ServiceInfo, WriteMode,
};

#[tokio::test(start_paused = true)]
async fn scan_ends_early_when_the_adapter_stops_it() -> anyhow::Result<()> {
    let config = FakeAdapterConfig::builder()
        .peripherals(vec![
            FakePeripheral::new("11:11", Some("OBD-II Adapter"), Some(-60)),
            FakePeripheral::new("22:22", Some("Generic Sensor"), Some(-70)),
        ])
        .scan_stop_after(Duration::from_secs(2))
        .build();
    let (session, _handle) = open(config).await?;

    let started = Instant::now();
    session.scan(Duration::from_secs(10)).await?;

    assert!(started.elapsed() < Duration::from_secs(10));
    let state = session.state();
    assert_eq!(ConnectionState::Idle, state.connection());
    let devices: Vec<_> = state
        .discovered_devices()
        .map(|device| (device.name(), device.likely_compatible()))
        .collect();
    assert_eq!(
        vec![
            (Some("OBD-II Adapter"), true),
            (Some("Generic Sensor"), false)
        ],
        devices
    );

    session.close().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_runs_until_its_deadline() -> anyhow::Result<()> {
    let config = FakeAdapterConfig::builder()
        .peripherals(vec![elm_adapter()])
        .scan_stop_after(Duration::from_secs(60))
        .build();
    let (session, _handle) = open(config).await?;

    let started = Instant::now();
    session.scan(Duration::from_secs(3)).await?;

    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(1, session.state().discovered_devices().count());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_requires_power_and_permissions() -> anyhow::Result<()> {
    let unpowered = FakeAdapterConfig::builder().powered_on(false).build();
    let (session, _handle) = open(unpowered).await?;
    assert_matches!(
        session.scan(Duration::from_secs(1)).await,
        Err(ElmError::AdapterOff)
    );
    assert_eq!(
        Some(ErrorKind::AdapterOff),
        session.state().last_error().map(|error| error.kind())
    );

    let unpermitted = FakeAdapterConfig::builder()
        .permissions_granted(false)
        .build();
    let (session, _handle) = open(unpermitted).await?;
    assert_eq!(false, session.state().has_permissions());
    assert_matches!(
        session.scan(Duration::from_secs(1)).await,
        Err(ElmError::PermissionMissing)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_picks_the_first_matching_catalog_entry() -> anyhow::Result<()> {
    let second_only = FakePeripheral::new(ADAPTER_ID, Some("HM-10 OBD"), Some(-50))
        .with_profile(&catalog_profile(1), WriteMode::WithAck);
    let config = FakeAdapterConfig::builder()
        .peripherals(vec![second_only])
        .responses(ResponseScript::default().with_reply("ATZ", ["ELM327 v1.5\r\r>"]))
        .build();
    let (session, handle) = open(config).await?;

    let profile = session.connect(ADAPTER_ID).await?;

    assert_eq!("hm10_ffe0", profile.label());
    assert_eq!(WriteMode::WithAck, profile.write_mode());
    let state = session.state();
    assert_eq!(ConnectionState::Connected, state.connection());
    assert_eq!(Some(ADAPTER_ID), state.connected_device_id());
    assert_eq!(Some(&profile), state.active_profile());

    let reply = session
        .send_command("ATZ", elmble::CommandOptions::default())?
        .await?;
    assert_eq!("ELM327 v1.5", reply);
    assert_matches!(
        handle.calls().last(),
        Some(FakeCall::Write {
            with_response: true,
            ..
        })
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn incompatible_device_is_released() -> anyhow::Result<()> {
    let speaker = FakePeripheral::new(ADAPTER_ID, Some("Speaker"), Some(-40))
        .with_services(vec![ServiceInfo::new("180f", Vec::new())]);
    let config = FakeAdapterConfig::builder()
        .peripherals(vec![speaker])
        .build();
    let (session, handle) = open(config).await?;

    let result = session.connect(ADAPTER_ID).await;

    assert_matches!(result, Err(ElmError::IncompatibleDevice { device_id, .. }) if device_id == ADAPTER_ID);
    assert!(handle.calls().contains(&FakeCall::Disconnect {
        id: ADAPTER_ID.to_string()
    }));
    assert_eq!(false, handle.is_connected(ADAPTER_ID));
    let state = session.state();
    assert_eq!(ConnectionState::Idle, state.connection());
    assert_eq!(
        Some(ErrorKind::IncompatibleDevice),
        state.last_error().map(|error| error.kind())
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_to_connected_device_is_idempotent() -> anyhow::Result<()> {
    let (session, handle) = connected(ResponseScript::default()).await?;
    let first = session.state().active_profile().cloned();

    let again = session.connect(ADAPTER_ID).await?;

    assert_eq!(first.as_ref(), Some(&again));
    let connects = handle
        .calls()
        .iter()
        .filter(|call| matches!(call, FakeCall::Connect { .. }))
        .count();
    assert_eq!(1, connects);

    assert_matches!(
        session.connect("FF:FF").await,
        Err(ElmError::ConnectedToOtherDevice { connected, requested })
            if connected == ADAPTER_ID && requested == "FF:FF"
    );
    assert_eq!(Some(ADAPTER_ID), session.state().connected_device_id());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_while_connecting_is_rejected() -> anyhow::Result<()> {
    let config = FakeAdapterConfig::builder()
        .peripherals(vec![elm_adapter()])
        .build();
    let (session, _handle) = open(config).await?;

    let first = session.connect(ADAPTER_ID);
    let second = session.connect(ADAPTER_ID);
    let (first, second) = tokio::join!(first, second);

    assert_matches!(first, Ok(_));
    assert_matches!(
        second,
        Err(ElmError::ConnectRejected {
            state: ConnectionState::Connecting,
            ..
        })
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_supersedes_a_running_scan() -> anyhow::Result<()> {
    let config = FakeAdapterConfig::builder()
        .peripherals(vec![elm_adapter()])
        .build();
    let (session, handle) = open(config).await?;

    let scan = session.scan(Duration::from_secs(30));
    let connect = async {
        wait_for_state(&session, |state| {
            state.discovered_device(ADAPTER_ID).is_some()
        })
        .await?;
        Ok::<_, anyhow::Error>(session.connect(ADAPTER_ID).await?)
    };
    let started = Instant::now();
    let (scanned, connected) = tokio::join!(scan, connect);

    scanned?;
    connected?;
    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(handle.calls().contains(&FakeCall::StopScan));
    assert_eq!(ConnectionState::Connected, session.state().connection());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_while_connected_is_rejected() -> anyhow::Result<()> {
    let (session, _handle) = connected(ResponseScript::default()).await?;

    assert_matches!(
        session.scan(Duration::from_secs(1)).await,
        Err(ElmError::ScanRejected {
            state: ConnectionState::Connected
        })
    );
    assert_eq!(ConnectionState::Connected, session.state().connection());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_releases_the_device() -> anyhow::Result<()> {
    let (session, handle) = connected(ResponseScript::default()).await?;

    session.disconnect().await?;

    let state = session.state();
    assert_eq!(ConnectionState::Idle, state.connection());
    assert_eq!(None, state.connected_device_id());
    assert_eq!(None, state.active_profile());
    assert_eq!(false, handle.is_connected(ADAPTER_ID));
    let calls = handle.calls();
    let unsubscribe = calls
        .iter()
        .position(|call| matches!(call, FakeCall::Unsubscribe { .. }));
    let disconnect = calls
        .iter()
        .position(|call| matches!(call, FakeCall::Disconnect { .. }));
    assert_matches!((unsubscribe, disconnect), (Some(before), Some(after)) if before < after);

    session.disconnect().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_failure_does_not_block_disconnect() -> anyhow::Result<()> {
    let config = FakeAdapterConfig::builder()
        .peripherals(vec![elm_adapter()])
        .failing_operations(vec![elmble::FakeOperation::Unsubscribe])
        .build();
    let (session, handle) = open(config).await?;
    session.connect(ADAPTER_ID).await?;

    session.disconnect().await?;

    assert_eq!(false, handle.is_connected(ADAPTER_ID));
    assert_eq!(ConnectionState::Idle, session.state().connection());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn remote_disconnect_clears_connection_state() -> anyhow::Result<()> {
    let (session, handle) = connected(ResponseScript::default()).await?;

    handle.drop_connection(ADAPTER_ID);
    let state = wait_for_state(&session, |state| {
        state.connection() == ConnectionState::Idle
    })
    .await?;

    assert_eq!(None, state.connected_device_id());
    assert_eq!(None, state.active_profile());
    assert_eq!(false, state.is_streaming());
    assert_eq!(
        false,
        handle
            .calls()
            .iter()
            .any(|call| matches!(call, FakeCall::Disconnect { .. }))
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_of_another_device_is_ignored() -> anyhow::Result<()> {
    let (session, handle) = connected(silent(ResponseScript::default(), "0100")).await?;
    let pending = session.send_command("0100", CommandOptions::default())?;
    wait_for_state(&session, |state| state.is_awaiting_response()).await?;

    handle.emit(AdapterEvent::PeripheralDisconnected {
        id: "99:99:99:99:99:99".into(),
        reason: None,
    });
    handle.notify(ADAPTER_ID, "41 00 BE 3F>");

    assert_eq!("41 00 BE 3F", pending.await?);
    let state = session.state();
    assert_eq!(ConnectionState::Connected, state.connection());
    assert_eq!(Some(ADAPTER_ID), state.connected_device_id());
    assert_eq!(
        Some(catalog_profile(0).label()),
        state.active_profile().map(|profile| profile.label())
    );
    assert_eq!(true, handle.is_connected(ADAPTER_ID));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn adapter_power_loss_ends_scan_and_connection() -> anyhow::Result<()> {
    let config = FakeAdapterConfig::builder()
        .peripherals(vec![elm_adapter()])
        .build();
    let (session, handle) = open(config).await?;

    let scan = session.scan(Duration::from_secs(30));
    let power_off = async {
        wait_for_state(&session, |state| {
            state.connection() == ConnectionState::Scanning
        })
        .await?;
        handle.set_powered(false);
        anyhow::Ok(())
    };
    let (scanned, powered_off) = tokio::join!(scan, power_off);
    powered_off?;

    assert_matches!(scanned, Err(ElmError::AdapterOff));
    let state = session.state();
    assert_eq!(false, state.is_bluetooth_on());
    assert_eq!(ConnectionState::Idle, state.connection());
    assert_matches!(
        session.connect(ADAPTER_ID).await,
        Err(ElmError::AdapterOff)
    );

    handle.set_powered(true);
    wait_for_state(&session, |state| state.is_bluetooth_on()).await?;
    session.connect(ADAPTER_ID).await?;
    handle.set_powered(false);
    let state = wait_for_state(&session, |state| {
        state.connection() == ConnectionState::Idle
    })
    .await?;
    assert_eq!(None, state.active_profile());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent_and_releases_the_device() -> anyhow::Result<()> {
    let (session, handle) = connected(ResponseScript::default()).await?;

    session.close().await;
    session.close().await;

    assert_eq!(false, handle.is_connected(ADAPTER_ID));
    assert_matches!(
        session.scan(Duration::from_secs(1)).await,
        Err(ElmError::SessionClosed)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn open_reports_initialisation_state() -> anyhow::Result<()> {
    let (session, _handle) = open(FakeAdapterConfig::builder().build()).await?;

    let state = session.state();
    assert_eq!(false, state.is_initializing());
    assert_eq!(true, state.is_bluetooth_on());
    assert_eq!(true, state.has_permissions());
    assert_eq!(ConnectionState::Idle, state.connection());
    Ok(())
}
