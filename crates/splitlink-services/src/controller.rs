//! Controller role — coordinates a run and collects its results.
//!
//! The controller snapshots its configured run parameters into an
//! immutable [`Settings`] value, pushes it to the relay and the source in
//! parallel, then sits on its listener collecting inference results and
//! process-time telemetry. In directory mode it checks each reported class
//! against the label file shipped beside the images and tracks a running
//! accuracy rate. Ctrl-C cascades the termination commands through the
//! topology before the controller itself exits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};

use splitlink_core::config::SplitlinkConfig;
use splitlink_core::envelope::{new_request_id, Plain, ProcessTime, SettingsPush};
use splitlink_core::{Request, Response, ResponsePayload, Settings};

use crate::net;
use crate::retry::RetryPolicy;

/// Outcome record for one inference target.
#[derive(Debug, Clone)]
struct TargetOutcome {
    result: String,
    label: Option<String>,
    correct: Option<bool>,
}

struct ControllerState {
    config: SplitlinkConfig,
    settings: Settings,
    outcomes: DashMap<String, TargetOutcome>,
    /// Previous process-time report, for delta logging.
    last_process_time: Mutex<Option<f64>>,
}

impl ControllerState {
    fn source_addr(&self) -> String {
        format!(
            "{}:{}",
            self.config.network.source_host, self.config.network.source_port
        )
    }

    fn relay_addr(&self) -> String {
        format!(
            "{}:{}",
            self.config.network.relay_host, self.config.network.relay_port
        )
    }

    /// Fraction of labelled targets classified correctly so far.
    fn accuracy_rate(&self) -> f64 {
        let mut total = 0u32;
        let mut correct = 0u32;
        for entry in self.outcomes.iter() {
            if let Some(is_correct) = entry.value().correct {
                total += 1;
                if is_correct {
                    correct += 1;
                }
            }
        }
        if total == 0 {
            return 0.0;
        }
        correct as f64 / total as f64
    }
}

/// Run the controller: push settings, then collect until terminated.
pub async fn run(config: SplitlinkConfig) -> Result<()> {
    let run_id = format!("run-{:.0}", crate::unix_time_secs());
    let settings = config.run.to_settings(run_id);
    tracing::info!(run_id = %settings.run_id, "run settings created");

    let bind = format!(
        "{}:{}",
        config.network.controller_host, config.network.controller_port
    );
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("controller failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "controller listening");

    let state = Arc::new(ControllerState {
        config,
        settings,
        outcomes: DashMap::new(),
        last_process_time: Mutex::new(None),
    });

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("cascading termination commands");
            send_end_commands(&state).await;
            let _ = shutdown.send(());
        });
    }

    push_settings(&state).await?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("controller shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("controller accept failed")?;
                tracing::debug!(%peer, "connection accepted");
                let state = state.clone();
                let shutdown = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(error) = handle_connection(stream, state, shutdown).await {
                        tracing::warn!(%error, "connection failed");
                    }
                });
            }
        }
    }

    log_run_summary(&state);
    Ok(())
}

/// Final operator-facing summary for the run.
fn log_run_summary(state: &Arc<ControllerState>) {
    for entry in state.outcomes.iter() {
        let outcome = entry.value();
        tracing::info!(
            run_id = %state.settings.run_id,
            target = %entry.key(),
            result = %outcome.result,
            label = outcome.label.as_deref().unwrap_or("-"),
            "target outcome"
        );
    }
    tracing::info!(
        run_id = %state.settings.run_id,
        targets = state.outcomes.len(),
        accuracy = state.accuracy_rate(),
        "run summary"
    );
}

/// Push the run settings to the relay and the source in parallel, each on
/// its own connection and retry budget.
async fn push_settings(state: &Arc<ControllerState>) -> Result<()> {
    let retry = RetryPolicy::new(state.config.run.max_retries);

    let relay = {
        let addr = state.relay_addr();
        let settings = state.settings.clone();
        retry.run("send-settings-relay", move || {
            let request = Request::SettingsToRelay(SettingsPush {
                request_id: new_request_id(),
                settings: settings.clone(),
            });
            let addr = addr.clone();
            async move { net::request(&addr, &request).await.map(|_| ()) }
        })
    };
    let source = {
        let addr = state.source_addr();
        let settings = state.settings.clone();
        retry.run("send-settings-source", move || {
            let request = Request::SettingsToSource(SettingsPush {
                request_id: new_request_id(),
                settings: settings.clone(),
            });
            let addr = addr.clone();
            async move { net::request(&addr, &request).await.map(|_| ()) }
        })
    };

    let (relay, source) = tokio::join!(relay, source);
    relay.context("settings push to relay failed")?;
    source.context("settings push to source failed")?;
    tracing::info!("settings pushed to relay and source");
    Ok(())
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    state: Arc<ControllerState>,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let body = net::read_envelope(&mut stream).await?;
    let request = match Request::decode(&body) {
        Ok(request) => request,
        Err(error) => {
            tracing::warn!(%error, "malformed envelope, closing connection");
            return Ok(());
        }
    };

    match request {
        Request::RelayInferenceResult(result) => {
            record_result(&state, &result.target, &result.result);
            net::respond(&mut stream, &Response::ok(&result.request_id)).await?;
        }
        Request::SourceProcessTime(report) | Request::RelayProcessTime(report) => {
            log_process_time(&state, &report).await;
            net::respond(&mut stream, &Response::ok(&report.request_id)).await?;
        }
        Request::SourceGetSettings(Plain { request_id })
        | Request::RelayGetSettings(Plain { request_id }) => {
            let payload = ResponsePayload::Settings {
                settings: state.settings.clone(),
            };
            net::respond(&mut stream, &Response::with_payload(&request_id, payload)).await?;
        }
        Request::ControllerEnd(Plain { request_id }) => {
            tracing::info!("termination command received");
            net::respond(&mut stream, &Response::ok(&request_id)).await?;
            let _ = shutdown.send(());
        }
        other => {
            tracing::warn!(command = ?other.command(), "command not handled by controller");
        }
    }
    Ok(())
}

/// Record one classification; when a label exists beside the input images,
/// check it and log the running accuracy.
fn record_result(state: &Arc<ControllerState>, target: &str, result: &str) {
    let label = lookup_label(Path::new(&state.settings.input_path), target);
    let correct = label.as_deref().map(|label| label == result);

    state.outcomes.insert(
        target.to_string(),
        TargetOutcome {
            result: result.to_string(),
            label: label.clone(),
            correct,
        },
    );

    match (label, correct) {
        (Some(label), Some(true)) => tracing::info!(
            target,
            result,
            %label,
            accuracy = state.accuracy_rate(),
            "inference result is correct"
        ),
        (Some(label), _) => tracing::info!(
            target,
            result,
            %label,
            accuracy = state.accuracy_rate(),
            "inference result is incorrect"
        ),
        (None, _) => tracing::info!(target, result, "inference result (no label)"),
    }
}

/// Directory-mode label lookup: `<base>/images/...` implies the label
/// lives at `<base>/labels/<target>.txt`.
fn lookup_label(input_path: &Path, target: &str) -> Option<String> {
    if !input_path.is_dir() {
        return None;
    }
    let images_dir: PathBuf = input_path.components().collect();
    let base = images_dir
        .iter()
        .position(|part| part == "images")
        .map(|idx| images_dir.iter().take(idx).collect::<PathBuf>())?;

    let label_path = base.join("labels").join(format!("{target}.txt"));
    match std::fs::read_to_string(&label_path) {
        Ok(text) => Some(text.trim().to_string()),
        Err(_) => {
            tracing::debug!(path = %label_path.display(), "no label file");
            None
        }
    }
}

/// Log a telemetry report: phase starts are logged as-is, phase ends with
/// the delta against the previous report.
async fn log_process_time(state: &Arc<ControllerState>, report: &ProcessTime) {
    let mut last = state.last_process_time.lock().await;
    if report.process_name.contains("start") {
        tracing::info!(process = %report.process_name, "process started");
    } else if let Some(previous) = *last {
        tracing::info!(
            process = %report.process_name,
            elapsed_secs = report.process_time - previous,
            "process finished"
        );
    } else {
        tracing::info!(process = %report.process_name, "process finished");
    }
    *last = Some(report.process_time);
}

/// Terminate the topology: source first, then relay, then our own loop is
/// stopped by the caller. Best-effort — an unreachable role is logged and
/// skipped.
async fn send_end_commands(state: &Arc<ControllerState>) {
    for (name, addr, request) in [
        (
            "source",
            state.source_addr(),
            Request::SourceEnd(Plain {
                request_id: new_request_id(),
            }),
        ),
        (
            "relay",
            state.relay_addr(),
            Request::RelayEnd(Plain {
                request_id: new_request_id(),
            }),
        ),
    ] {
        match net::request(&addr, &request).await {
            Ok(_) => tracing::info!(role = name, "terminated"),
            Err(error) => tracing::warn!(role = name, %error, "termination not delivered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(input_path: &str) -> Arc<ControllerState> {
        let config = SplitlinkConfig::default();
        let mut settings = config.run.to_settings("run-test".into());
        settings.input_path = input_path.to_string();
        Arc::new(ControllerState {
            config,
            settings,
            outcomes: DashMap::new(),
            last_process_time: Mutex::new(None),
        })
    }

    fn record(state: &Arc<ControllerState>, target: &str, result: &str, label: Option<&str>) {
        state.outcomes.insert(
            target.to_string(),
            TargetOutcome {
                result: result.to_string(),
                label: label.map(String::from),
                correct: label.map(|label| label == result),
            },
        );
    }

    #[test]
    fn accuracy_tracks_labelled_targets_only() {
        let state = test_state("data/input");
        record(&state, "a", "3", Some("3"));
        record(&state, "b", "7", Some("1"));
        record(&state, "c", "5", None);
        assert_eq!(state.accuracy_rate(), 0.5);
    }

    #[test]
    fn accuracy_is_zero_with_no_labels() {
        let state = test_state("data/input");
        assert_eq!(state.accuracy_rate(), 0.0);
        record(&state, "a", "3", None);
        assert_eq!(state.accuracy_rate(), 0.0);
    }

    #[test]
    fn label_lookup_walks_from_images_to_labels() {
        let base =
            std::env::temp_dir().join(format!("splitlink-ctl-test-{}", std::process::id()));
        let images = base.join("dataset").join("images");
        let labels = base.join("dataset").join("labels");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&labels).unwrap();
        std::fs::write(labels.join("00042.txt"), "7\n").unwrap();

        assert_eq!(lookup_label(&images, "00042").as_deref(), Some("7"));
        assert_eq!(lookup_label(&images, "00043"), None);

        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn label_lookup_requires_directory_mode() {
        assert_eq!(lookup_label(Path::new("/nonexistent/file.png"), "x"), None);
    }
}
