use clap::Parser;
use pretty_assertions::assert_eq;

#[derive(Debug, Default)]
struct FakeTerminalClient;

impl elmble::TerminalClient for FakeTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        false
    }

    fn stderr_is_terminal(&self) -> bool {
        false
    }
}

const FIXTURE: &str = "AA:BB:CC|OBDII|-58|1;11:22:33|Speaker|-40";

async fn run_with_argv(argv: &[&str], output: elmble::OutputFormat) -> anyhow::Result<String> {
    let args = elmble::Args::try_parse_from(argv)?;
    let log_level = args.log_level();
    let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
    let adapter = match maybe_fake_args {
        Some(fake_args) => elmble::fake_adapter(fake_args)?,
        None => elmble::real_adapter().await?,
    };

    let mut out = Vec::new();
    elmble::run_with_clients_and_log_level(
        command,
        &mut out,
        &FakeTerminalClient,
        adapter,
        log_level,
        output,
    )
    .await?;
    Ok(String::from_utf8(out)?)
}

#[tokio::test(start_paused = true)]
async fn scan_prints_devices_as_json() -> anyhow::Result<()> {
    let output = run_with_argv(
        &["elmble", "--fake", "--fake-scan", FIXTURE, "scan", "--duration", "2s"],
        elmble::OutputFormat::Json,
    )
    .await?;

    let devices: serde_json::Value = serde_json::from_str(&output)?;
    assert_eq!(
        serde_json::json!([
            {"id": "11:22:33", "name": "Speaker", "rssi": -40, "likely_compatible": false},
            {"id": "AA:BB:CC", "name": "OBDII", "rssi": -58, "likely_compatible": true},
        ]),
        devices
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_table_can_hide_incompatible_devices() -> anyhow::Result<()> {
    let output = run_with_argv(
        &[
            "elmble",
            "--fake",
            "--fake-scan",
            FIXTURE,
            "scan",
            "--duration",
            "2s",
            "--compatible-only",
        ],
        elmble::OutputFormat::Pretty,
    )
    .await?;

    assert!(output.starts_with("Discovered devices: (1 found, 1 likely ELM327)"));
    assert!(output.contains("AA:BB:CC"));
    assert!(!output.contains("Speaker"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn send_picks_the_compatible_adapter_and_prints_responses() -> anyhow::Result<()> {
    let output = run_with_argv(
        &[
            "elmble",
            "--fake",
            "--fake-scan",
            FIXTURE,
            "--fake-responses",
            "ATZ=ELM327 v1.5\\r\\r>;010C=41 0C 1A|F8>",
            "send",
            "--scan-duration",
            "1s",
            "ATZ",
            "010C",
        ],
        elmble::OutputFormat::Json,
    )
    .await?;

    let reports: Vec<serde_json::Value> = output
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(
        vec![
            serde_json::json!({"command": "ATZ", "shape": "text", "status": "text", "text": "ELM327 v1.5"}),
            serde_json::json!({"command": "010C", "shape": "text", "status": "text", "text": "41 0C 1AF8"}),
        ],
        reports
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn send_chunked_shows_fragments() -> anyhow::Result<()> {
    let output = run_with_argv(
        &[
            "elmble",
            "--fake",
            "--fake-scan",
            FIXTURE,
            "--fake-responses",
            "010C=41 0C 1A|F8>",
            "send",
            "--device",
            "AA:BB:CC",
            "--shape",
            "chunked",
            "010C",
        ],
        elmble::OutputFormat::Json,
    )
    .await?;

    let report: serde_json::Value = serde_json::from_str(output.trim())?;
    assert_eq!("chunked_bytes", report["shape"]);
    assert_eq!(
        serde_json::json!(["34 31 20 30 43 20 31 41", "46 38"]),
        report["chunks"]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn send_reports_timeouts_as_failures() -> anyhow::Result<()> {
    let result = run_with_argv(
        &[
            "elmble",
            "--fake",
            "--fake-scan",
            FIXTURE,
            "--fake-responses",
            "0100=",
            "send",
            "--device",
            "AA:BB:CC",
            "--timeout",
            "500ms",
            "0100",
        ],
        elmble::OutputFormat::Json,
    )
    .await;

    let error = result.expect_err("a silent adapter should fail the run");
    assert_eq!("1 of 1 commands failed", error.to_string());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn send_without_compatible_devices_fails() -> anyhow::Result<()> {
    let result = run_with_argv(
        &[
            "elmble",
            "--fake",
            "--fake-scan",
            "11:22:33|Speaker|-40",
            "send",
            "--scan-duration",
            "1s",
            "ATZ",
        ],
        elmble::OutputFormat::Json,
    )
    .await;

    let error = result.expect_err("no adapter to talk to");
    assert!(error.to_string().contains("no likely ELM327 adapter"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn monitor_polls_until_the_count_is_reached() -> anyhow::Result<()> {
    let output = run_with_argv(
        &[
            "elmble",
            "--fake",
            "--fake-scan",
            FIXTURE,
            "--fake-responses",
            "010C=41 0C 1A|F8>",
            "monitor",
            "--device",
            "AA:BB:CC",
            "--count",
            "3",
        ],
        elmble::OutputFormat::Json,
    )
    .await?;

    let lines: Vec<serde_json::Value> = output
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(4, lines.len());
    assert_eq!(3, lines[2]["index"]);
    assert_eq!("41 0C 1AF8", lines[2]["text"]);
    assert_eq!(
        serde_json::json!({"samples": 3, "succeeded": 3, "failed": 0, "stop_reason": "count_reached"}),
        lines[3]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn monitor_stops_when_the_watchdog_trips() -> anyhow::Result<()> {
    let output = run_with_argv(
        &[
            "elmble",
            "--fake",
            "--fake-scan",
            FIXTURE,
            "--fake-responses",
            "010C=",
            "monitor",
            "--device",
            "AA:BB:CC",
            "--interval",
            "1s",
            "--timeout",
            "500ms",
        ],
        elmble::OutputFormat::Json,
    )
    .await?;

    let summary: serde_json::Value = serde_json::from_str(
        output
            .lines()
            .last()
            .expect("a summary line is always printed"),
    )?;
    assert_eq!("inactivity", summary["stop_reason"]);
    assert_eq!(0, summary["succeeded"]);
    Ok(())
}
