mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio::time::{Instant, sleep};

use common::{connected, connected_with, open, silent, wait_for_state};
use elmble::{
    CommandOptions, ElmError, ErrorKind, FakeAdapterConfig, ResponseScript, SessionConfig,
};

fn rpm_script() -> ResponseScript {
    ResponseScript::default().with_reply("010C", ["41 0C 1A", "F8>"])
}

#[tokio::test(start_paused = true)]
async fn watchdog_stops_streaming_without_successful_commands() -> anyhow::Result<()> {
    let (session, _handle) = connected(rpm_script()).await?;

    let started = Instant::now();
    session.set_streaming(true)?.await?;
    assert_eq!(true, session.state().is_streaming());

    let state = wait_for_state(&session, |state| !state.is_streaming()).await?;

    assert!(started.elapsed() > Duration::from_secs(4));
    assert!(started.elapsed() <= Duration::from_secs(6));
    assert_eq!(
        Some(ErrorKind::StreamingInactivity),
        state.last_error().map(|error| error.kind())
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn successful_polling_keeps_streaming_alive() -> anyhow::Result<()> {
    let (session, _handle) = connected(rpm_script()).await?;
    session.set_streaming(true)?.await?;

    for _ in 0..20 {
        sleep(Duration::from_millis(500)).await;
        session
            .send_command("010C", CommandOptions::default())?
            .await?;
    }

    let state = session.state();
    assert_eq!(true, state.is_streaming());
    assert_eq!(None, state.last_error());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_commands_do_not_refresh_the_watchdog() -> anyhow::Result<()> {
    let (session, _handle) = connected(silent(rpm_script(), "0100")).await?;
    session.set_streaming(true)?.await?;

    let options = CommandOptions::default().with_timeout(Duration::from_millis(500));
    for _ in 0..12 {
        if !session.state().is_streaming() {
            break;
        }
        let result = session.send_command("0100", options)?.await;
        assert_matches!(result, Err(ElmError::CommandTimeout { .. }));
    }

    let state = wait_for_state(&session, |state| !state.is_streaming()).await?;
    assert_eq!(
        Some(ErrorKind::StreamingInactivity),
        state.last_error().map(|error| error.kind())
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn threshold_and_interval_are_configurable() -> anyhow::Result<()> {
    let config = SessionConfig::builder()
        .inactivity_threshold(Duration::from_millis(300))
        .watchdog_interval(Duration::from_millis(100))
        .build();
    let (session, _handle) = connected_with(rpm_script(), config).await?;

    let started = Instant::now();
    session.set_streaming(true)?.await?;
    wait_for_state(&session, |state| !state.is_streaming()).await?;

    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restarting_streaming_clears_the_inactivity_error() -> anyhow::Result<()> {
    let (session, _handle) = connected(rpm_script()).await?;
    session.set_streaming(true)?.await?;
    wait_for_state(&session, |state| !state.is_streaming()).await?;

    session.set_streaming(true)?.await?;

    let state = session.state();
    assert_eq!(true, state.is_streaming());
    assert_eq!(None, state.last_error());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn user_stop_does_not_raise_an_error() -> anyhow::Result<()> {
    let (session, _handle) = connected(rpm_script()).await?;
    session.set_streaming(true)?.await?;

    session.set_streaming(false)?.await?;
    sleep(Duration::from_secs(10)).await;

    let state = session.state();
    assert_eq!(false, state.is_streaming());
    assert_eq!(None, state.last_error());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_forces_streaming_off_silently() -> anyhow::Result<()> {
    let (session, _handle) = connected(rpm_script()).await?;
    session.set_streaming(true)?.await?;

    session.disconnect().await?;
    sleep(Duration::from_secs(10)).await;

    let state = session.state();
    assert_eq!(false, state.is_streaming());
    assert_eq!(None, state.last_error());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn streaming_requires_a_connection() -> anyhow::Result<()> {
    let (session, _handle) = open(FakeAdapterConfig::builder().build()).await?;

    assert_matches!(session.set_streaming(true), Err(ElmError::NotConnected));
    session.set_streaming(false)?.await?;
    assert_eq!(false, session.state().is_streaming());
    Ok(())
}
