mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use common::{ADAPTER_ID, connected, elm_adapter, open, silent, wait_for_state};
use elmble::{
    CommandOptions, ConnectionState, ElmError, ErrorKind, FakeAdapterConfig, FakeOperation,
    ResponseScript, SessionConfig,
};

fn rpm_script() -> ResponseScript {
    ResponseScript::default().with_reply("010C", ["41 0C 1A", "F8>"])
}

#[tokio::test(start_paused = true)]
async fn fragmented_response_resolves_as_text() -> anyhow::Result<()> {
    let (session, handle) = connected(rpm_script()).await?;

    let text = session
        .send_command("010C", CommandOptions::default())?
        .await?;

    assert_eq!("41 0C 1AF8", text);
    assert_eq!(vec!["010C\r".to_string()], handle.writes());
    let state = session.state();
    assert_eq!(false, state.is_awaiting_response());
    assert_eq!(None, state.pending_command());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn chunked_response_keeps_fragment_boundaries() -> anyhow::Result<()> {
    let (session, _handle) = connected(rpm_script()).await?;

    let response = session
        .send_command_chunked("010C", CommandOptions::default())?
        .await?;

    assert_eq!(b"41 0C 1AF8".as_slice(), response.data());
    assert_eq!(
        vec![b"41 0C 1A".to_vec(), b"F8".to_vec()],
        response.chunks().to_vec()
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bytes_after_the_terminator_do_not_leak_into_the_next_command() -> anyhow::Result<()> {
    let script = ResponseScript::default()
        .with_reply("0100", ["41 00 BE 3F>SEARCHING", "..."])
        .with_reply("ATRV", ["12.6V\r\r>"]);
    let (session, _handle) = connected(script).await?;

    let first = session
        .send_command_bytes("0100", CommandOptions::default())?
        .await?;
    let second = session
        .send_command("ATRV", CommandOptions::default())?
        .await?;

    assert_eq!(b"41 00 BE 3F".to_vec(), first);
    assert_eq!("12.6V", second);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn second_command_is_rejected_while_one_is_pending() -> anyhow::Result<()> {
    let (session, _handle) = connected(silent(rpm_script(), "0100")).await?;

    let pending = session.send_command("0100", CommandOptions::default())?;
    wait_for_state(&session, |state| state.is_awaiting_response()).await?;

    assert_matches!(
        session.send_command("010C", CommandOptions::default()),
        Err(ElmError::CommandInProgress { requested, pending }) if requested == "010C" && pending == "0100"
    );
    assert_eq!(Some("0100"), session.state().pending_command());
    assert_eq!(None, session.state().last_error());

    assert_matches!(pending.await, Err(ElmError::CommandTimeout { .. }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn back_to_back_commands_reject_the_second_at_the_call() -> anyhow::Result<()> {
    let (session, _handle) = connected(rpm_script()).await?;

    let first = session.send_command("010C", CommandOptions::default())?;
    let second = session.send_command("ATZ", CommandOptions::default());

    assert_matches!(
        second,
        Err(ElmError::CommandInProgress { requested, pending }) if requested == "ATZ" && pending == "010C"
    );
    assert_eq!("41 0C 1AF8", first.await?);

    let third = session.send_command("010C", CommandOptions::default())?;
    assert_eq!("41 0C 1AF8", third.await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn refused_command_frees_the_slot() -> anyhow::Result<()> {
    let (session, _handle) = connected(rpm_script()).await?;

    let (disconnected, refused) = tokio::join!(session.disconnect(), async {
        session
            .send_command("010C", CommandOptions::default())?
            .await
    });
    disconnected?;
    assert_matches!(refused, Err(ElmError::NotConnected));

    session.connect(ADAPTER_ID).await?;
    let text = session
        .send_command("010C", CommandOptions::default())?
        .await?;
    assert_eq!("41 0C 1AF8", text);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_adapter_times_out_and_frees_the_slot() -> anyhow::Result<()> {
    let (session, _handle) = connected(silent(rpm_script(), "0100")).await?;

    let timeout = Duration::from_millis(750);
    let result = session
        .send_command("0100", CommandOptions::default().with_timeout(timeout))?
        .await;

    assert_matches!(
        result,
        Err(ElmError::CommandTimeout { command, timeout: elapsed }) if command == "0100" && elapsed == timeout
    );
    let state = session.state();
    assert_eq!(false, state.is_awaiting_response());
    assert_eq!(
        Some(ErrorKind::CommandTimeout),
        state.last_error().map(|error| error.kind())
    );

    let text = session
        .send_command("010C", CommandOptions::default())?
        .await?;
    assert_eq!("41 0C 1AF8", text);
    assert_eq!(None, session.state().last_error());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn session_default_timeout_applies() -> anyhow::Result<()> {
    let config = SessionConfig::builder()
        .command_timeout(Duration::from_secs(2))
        .build();
    let (session, _handle) = common::connected_with(silent(rpm_script(), "0100"), config).await?;

    let started = tokio::time::Instant::now();
    let result = session
        .send_command("0100", CommandOptions::default())?
        .await;

    assert_matches!(result, Err(ElmError::CommandTimeout { .. }));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(3));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_the_pending_command() -> anyhow::Result<()> {
    let (session, _handle) = connected(silent(rpm_script(), "0100")).await?;

    let pending = session.send_command("0100", CommandOptions::default())?;
    wait_for_state(&session, |state| state.is_awaiting_response()).await?;
    session.disconnect().await?;

    assert_matches!(
        pending.await,
        Err(ElmError::DisconnectedDuringCommand { command }) if command == "0100"
    );
    let state = session.state();
    assert_eq!(ConnectionState::Idle, state.connection());
    assert_eq!(false, state.is_awaiting_response());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn link_loss_cancels_the_pending_command() -> anyhow::Result<()> {
    let (session, handle) = connected(silent(rpm_script(), "0100")).await?;

    let pending = session.send_command("0100", CommandOptions::default())?;
    wait_for_state(&session, |state| state.is_awaiting_response()).await?;
    handle.drop_connection(ADAPTER_ID);

    assert_matches!(
        pending.await,
        Err(ElmError::DisconnectedDuringCommand { .. })
    );
    assert_matches!(
        session.send_command("010C", CommandOptions::default()),
        Err(ElmError::NotConnected)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn write_failure_rejects_the_command() -> anyhow::Result<()> {
    let config = FakeAdapterConfig::builder()
        .peripherals(vec![elm_adapter()])
        .responses(rpm_script())
        .failing_operations(vec![FakeOperation::Write])
        .build();
    let (session, _handle) = open(config).await?;
    session.connect(ADAPTER_ID).await?;

    let result = session
        .send_command("010C", CommandOptions::default())?
        .await;

    assert_matches!(result, Err(ElmError::Write { command, .. }) if command == "010C");
    let state = session.state();
    assert_eq!(false, state.is_awaiting_response());
    assert_eq!(
        Some(ErrorKind::Write),
        state.last_error().map(|error| error.kind())
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn undecodable_text_is_reported() -> anyhow::Result<()> {
    let script = ResponseScript::default().with_reply("0902", [b"\xff\xfe>".as_slice()]);
    let (session, _handle) = connected(script).await?;

    let result = session
        .send_command("0902", CommandOptions::default())?
        .await;

    assert_matches!(result, Err(ElmError::ResponseDecode { .. }));
    assert_eq!(false, session.state().is_awaiting_response());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unknown_commands_get_the_adapter_question_mark() -> anyhow::Result<()> {
    let (session, _handle) = connected(ResponseScript::default()).await?;

    let text = session
        .send_command("ATXYZ", CommandOptions::default())?
        .await?;

    assert_eq!("?", text);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn commands_require_a_connection() -> anyhow::Result<()> {
    let (session, _handle) = open(FakeAdapterConfig::builder().build()).await?;

    assert_matches!(
        session.send_command("010C", CommandOptions::default()),
        Err(ElmError::NotConnected)
    );
    assert_matches!(
        session.send_command_bytes("010C", CommandOptions::default()),
        Err(ElmError::NotConnected)
    );
    assert_eq!(None, session.state().last_error());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reconnect_starts_with_an_empty_slot() -> anyhow::Result<()> {
    let (session, _handle) = connected(silent(rpm_script(), "0100")).await?;

    let pending = session.send_command("0100", CommandOptions::default())?;
    wait_for_state(&session, |state| state.is_awaiting_response()).await?;
    session.disconnect().await?;
    assert_matches!(pending.await, Err(_));

    session.connect(ADAPTER_ID).await?;
    assert_eq!(None, session.state().pending_command());
    let text = session
        .send_command("010C", CommandOptions::default())?
        .await?;
    assert_eq!("41 0C 1AF8", text);
    Ok(())
}
