#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use elmble::{
    AggregateState, DeviceProfile, FakeAdapter, FakeAdapterConfig, FakeAdapterHandle,
    FakePeripheral, ProfileCatalog, ResponseScript, Session, SessionConfig, WriteMode,
};

pub const ADAPTER_ID: &str = "AA:BB:CC:DD:EE:01";

/// Catalog entry at 0-based `index` of the built-in catalog.
pub fn catalog_profile(index: usize) -> DeviceProfile {
    ProfileCatalog::default().profiles()[index].clone()
}

/// An ELM327 adapter exposing the first catalog profile.
pub fn elm_adapter() -> FakePeripheral {
    FakePeripheral::new(ADAPTER_ID, Some("OBDII"), Some(-58))
        .with_profile(&catalog_profile(0), WriteMode::NoAck)
}

pub fn silent(script: ResponseScript, command: &str) -> ResponseScript {
    script.with_reply(command, std::iter::empty::<&str>())
}

pub async fn open(config: FakeAdapterConfig) -> anyhow::Result<(Session, FakeAdapterHandle)> {
    open_with(config, SessionConfig::default()).await
}

pub async fn open_with(
    config: FakeAdapterConfig,
    session_config: SessionConfig,
) -> anyhow::Result<(Session, FakeAdapterHandle)> {
    let adapter = FakeAdapter::new(config);
    let handle = adapter.handle();
    let session = Session::open(Arc::new(adapter), session_config).await?;
    Ok((session, handle))
}

/// Opens a session already connected to [`elm_adapter`].
pub async fn connected(responses: ResponseScript) -> anyhow::Result<(Session, FakeAdapterHandle)> {
    connected_with(responses, SessionConfig::default()).await
}

pub async fn connected_with(
    responses: ResponseScript,
    session_config: SessionConfig,
) -> anyhow::Result<(Session, FakeAdapterHandle)> {
    let config = FakeAdapterConfig::builder()
        .peripherals(vec![elm_adapter()])
        .responses(responses)
        .build();
    let (session, handle) = open_with(config, session_config).await?;
    session.connect(ADAPTER_ID).await?;
    Ok((session, handle))
}

/// Waits until the published state satisfies `predicate`.
pub async fn wait_for_state(
    session: &Session,
    predicate: impl FnMut(&AggregateState) -> bool,
) -> anyhow::Result<AggregateState> {
    let mut state = session.watch_state();
    let matched =
        tokio::time::timeout(Duration::from_secs(30), state.wait_for(predicate)).await??;
    Ok(matched.clone())
}
