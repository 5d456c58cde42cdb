//! Source role — produces intermediate data and streams it to the relay.
//!
//! The source listens for control envelopes (settings push, received-result
//! ack, termination) on its TCP port. A settings push kicks off a run task
//! that walks the inference targets, runs the front half of the model,
//! quantizes, packetizes, and streams packets to the relay over TCP or UDP.
//! The relay's received-result ack — either outcome — flips the stop flag
//! and ends the current target's stream early.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, Mutex};

use splitlink_core::config::SplitlinkConfig;
use splitlink_core::envelope::{new_request_id, Plain, ProcessTime, ResultData, ResultSummary};
use splitlink_core::packet::{split_bytes, split_elements, SplitPlan};
use splitlink_core::reduce::{PcaReduction, ReductionCodec};
use splitlink_core::{codec, Request, Response, ResponseCode, Settings, Transport};

use crate::engine::{InferenceEngine, ModelHandle};
use crate::net;
use crate::netem;
use crate::retry::RetryPolicy;

struct SourceState {
    config: SplitlinkConfig,
    engine: Arc<dyn InferenceEngine>,
    /// Model handle reused across runs unless the settings say reload.
    model: Mutex<Option<ModelHandle>>,
    /// Flipped by the relay's received-result ack; stops the packet stream.
    stop_streaming: AtomicBool,
}

impl SourceState {
    fn relay_addr(&self) -> String {
        format!(
            "{}:{}",
            self.config.network.relay_host, self.config.network.relay_port
        )
    }

    fn relay_udp_addr(&self) -> String {
        format!(
            "{}:{}",
            self.config.network.relay_host, self.config.network.relay_udp_port
        )
    }

    fn controller_addr(&self) -> String {
        format!(
            "{}:{}",
            self.config.network.controller_host, self.config.network.controller_port
        )
    }
}

/// Run the source endpoint until its termination command arrives.
pub async fn run(config: SplitlinkConfig, engine: Arc<dyn InferenceEngine>) -> Result<()> {
    let bind = format!(
        "{}:{}",
        config.network.source_host, config.network.source_port
    );
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("source failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "source listening");

    let state = Arc::new(SourceState {
        config,
        engine,
        model: Mutex::new(None),
        stop_streaming: AtomicBool::new(false),
    });

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            let _ = shutdown.send(());
        });
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("source shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("source accept failed")?;
                tracing::debug!(%peer, "control connection accepted");
                let state = state.clone();
                let shutdown = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(error) = handle_connection(stream, state, shutdown).await {
                        tracing::warn!(%error, "control connection failed");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    state: Arc<SourceState>,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let body = net::read_envelope(&mut stream).await?;
    let request = match Request::decode(&body) {
        Ok(request) => request,
        Err(error) => {
            // Protocol error: drop the connection, no response, no retry.
            tracing::warn!(%error, "malformed envelope, closing connection");
            return Ok(());
        }
    };

    match request {
        Request::SettingsToSource(push) => {
            tracing::info!(run_id = %push.settings.run_id, "settings received");
            if let Err(error) = netem::apply(
                &state.config.network.source_device,
                &push.settings.source_link,
            )
            .await
            {
                tracing::warn!(%error, "source link shaping failed");
            }
            net::respond(&mut stream, &Response::ok(&push.request_id)).await?;

            let state = state.clone();
            tokio::spawn(async move {
                if let Err(error) = process_targets(&state, push.settings).await {
                    tracing::error!(%error, "run aborted");
                }
            });
        }
        Request::ReceivedResult(ack) => {
            match ack.code {
                ResponseCode::SufficientData => {
                    tracing::info!("relay reports sufficient data, stopping stream")
                }
                ResponseCode::TimeExceeded => {
                    tracing::info!("relay reports waiting time exceeded, stopping stream")
                }
                other => tracing::warn!(code = ?other, "unexpected received-result code"),
            }
            state.stop_streaming.store(true, Ordering::SeqCst);
            net::respond(&mut stream, &Response::ok(&ack.request_id)).await?;
        }
        Request::SourceEnd(Plain { request_id }) => {
            tracing::info!("termination command received");
            net::respond(&mut stream, &Response::ok(&request_id)).await?;
            let _ = shutdown.send(());
        }
        other => {
            // Unmapped command on this role: log and drop, never crash.
            tracing::warn!(command = ?other.command(), "command not handled by source");
        }
    }
    Ok(())
}

// ── Run pipeline ──────────────────────────────────────────────────────────────

/// Walk the run's inference targets in order, streaming each to the relay.
async fn process_targets(state: &SourceState, settings: Settings) -> Result<()> {
    let retry = RetryPolicy::new(state.config.run.max_retries);
    let targets = list_targets(Path::new(&settings.input_path))?;
    tracing::info!(run_id = %settings.run_id, targets = targets.len(), "run starting");

    // The basis is keyed by (model, split layer); one load covers the run.
    let reduction = if reduction_active(&settings) {
        Some(PcaReduction::load(
            &state.config.paths.basis_dir,
            &settings.model,
            settings.split_layer,
        )?)
    } else {
        None
    };

    for target in &targets {
        match stream_one_target(state, &settings, &retry, reduction.as_ref(), target).await {
            Ok(()) => {}
            Err(error) => {
                // Transport exhaustion is fatal to this target only.
                tracing::error!(target = %target.display(), %error, "target aborted");
            }
        }
    }

    if let Err(error) = netem::clear(
        &state.config.network.source_device,
        &settings.source_link,
    )
    .await
    {
        tracing::warn!(%error, "source link shaping reset failed");
    }
    tracing::info!(run_id = %settings.run_id, "run finished");
    Ok(())
}

fn reduction_active(settings: &Settings) -> bool {
    settings.split_layer > 0 && settings.pca_rate != 0.0 && settings.pca_rate != 1.0
}

/// Inference targets: a directory is walked in sorted order, a file is a
/// single target.
fn list_targets(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(input)
            .with_context(|| format!("cannot read target directory {}", input.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        Ok(files)
    } else {
        Ok(vec![input.to_path_buf()])
    }
}

async fn stream_one_target(
    state: &SourceState,
    settings: &Settings,
    retry: &RetryPolicy,
    reduction: Option<&PcaReduction>,
    target: &Path,
) -> Result<()> {
    let target_name = target
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("target")
        .to_string();
    let bytes = std::fs::read(target)
        .with_context(|| format!("cannot read target {}", target.display()))?;

    let (plan, shape) = build_plan(state, settings, reduction, &bytes).await?;
    tracing::info!(
        target = %target_name,
        packets = plan.packet_count,
        elements = plan.element_count,
        "target packetized"
    );

    // Summary first — it sizes the relay's reception window.
    let summary = ResultSummary {
        request_id: new_request_id(),
        num_packets: plan.packet_count,
        num_elements: plan.element_count,
        random_seed: settings.random_seed,
        target: target_name.clone(),
        shape,
    };
    let relay_addr = state.relay_addr();
    retry
        .run("send-summary", || {
            let request = Request::ResultSummary(summary.clone());
            let addr = relay_addr.clone();
            async move { net::request(&addr, &request).await.map(|_| ()) }
        })
        .await?;

    state.stop_streaming.store(false, Ordering::SeqCst);
    report_process_time(state, format!("source:transmission:start:{target_name}")).await;
    send_packets(state, settings, retry, &plan).await?;
    report_process_time(state, format!("source:transmission:end:{target_name}")).await;

    let sent_bytes: u64 = plan.packets.iter().map(|p| p.payload.len() as u64).sum();
    tracing::info!(
        target = %target_name,
        packets = plan.packet_count,
        bytes = sent_bytes,
        "target streamed"
    );
    Ok(())
}

/// Produce the packet plan for one target: raw bytes at split layer 0,
/// front-half activations otherwise.
async fn build_plan(
    state: &SourceState,
    settings: &Settings,
    reduction: Option<&PcaReduction>,
    input_bytes: &[u8],
) -> Result<(SplitPlan, Option<Vec<usize>>)> {
    if settings.split_layer == 0 {
        let plan = split_bytes(input_bytes, settings.max_packet_bytes)?;
        return Ok((plan, None));
    }

    let model = load_model(state, settings).await?;
    let input = state.engine.decode_input(input_bytes)?;
    let mut inter = state
        .engine
        .run_slice(&model, 1, settings.split_layer, &input)?;

    if let Some(reduction) = reduction {
        inter = reduction.reduce(&inter, settings.pca_rate)?;
    }
    tracing::info!(
        pca_rate = settings.pca_rate,
        quant = %settings.quant,
        elements = inter.len(),
        "intermediate tensor compressed"
    );

    let shape = inter.shape().to_vec();
    let codes = codec::encode(&inter, settings.quant)?;
    let plan = split_elements(&codes, settings.split_mode, settings.random_seed);
    Ok((plan, Some(shape)))
}

async fn load_model(state: &SourceState, settings: &Settings) -> Result<ModelHandle> {
    let mut cached = state.model.lock().await;
    match cached.as_ref() {
        Some(handle) if !settings.reload_model => Ok(handle.clone()),
        _ => {
            let handle = state.engine.load_model(&settings.model)?;
            tracing::info!(model = %settings.model, layers = handle.layer_count, "model loaded");
            *cached = Some(handle.clone());
            Ok(handle)
        }
    }
}

/// Stream the plan's packets, honouring the stop flag between packets. An
/// in-flight packet always completes or fails outright — there is no
/// mid-packet cancellation.
async fn send_packets(
    state: &SourceState,
    settings: &Settings,
    retry: &RetryPolicy,
    plan: &SplitPlan,
) -> Result<()> {
    let udp_socket = match settings.transport {
        Transport::Udp => Some(
            UdpSocket::bind("0.0.0.0:0")
                .await
                .context("udp socket bind failed")?,
        ),
        Transport::Tcp => None,
    };

    for packet in &plan.packets {
        if state.stop_streaming.load(Ordering::SeqCst) {
            tracing::info!(sequence = packet.sequence, "stream stopped by relay ack");
            break;
        }

        let data = ResultData {
            request_id: new_request_id(),
            sequence: packet.sequence,
            payload: packet.payload.clone(),
        };
        let request = Request::ResultData(data);

        match &udp_socket {
            // Fire-and-forget: no response on the data plane.
            Some(socket) => {
                let addr = state.relay_udp_addr();
                retry
                    .run("send-data", || {
                        let request = request.clone();
                        let addr = addr.clone();
                        async move { net::send_datagram(socket, &addr, &request).await }
                    })
                    .await?;
            }
            None => {
                let addr = state.relay_addr();
                retry
                    .run("send-data", || {
                        let request = request.clone();
                        let addr = addr.clone();
                        async move { net::request(&addr, &request).await.map(|_| ()) }
                    })
                    .await?;
            }
        }
        tracing::debug!(sequence = packet.sequence, "packet sent");
    }
    Ok(())
}

/// Best-effort telemetry to the controller. Failures are logged and
/// swallowed — timing reports never block the data path.
async fn report_process_time(state: &SourceState, process_name: String) {
    let request = Request::SourceProcessTime(ProcessTime {
        request_id: new_request_id(),
        process_name,
        process_time: crate::unix_time_secs(),
    });
    if let Err(error) = net::request(&state.controller_addr(), &request).await {
        tracing::debug!(%error, "process-time report failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_targets_are_sorted() {
        let dir = std::env::temp_dir().join(format!("splitlink-src-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["00002.png", "00000.png", "00001.png"] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }

        let targets = list_targets(&dir).unwrap();
        let names: Vec<String> = targets
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["00000.png", "00001.png", "00002.png"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn single_file_is_a_single_target() {
        let file = std::env::temp_dir().join(format!("splitlink-one-{}.png", std::process::id()));
        std::fs::write(&file, b"x").unwrap();
        let targets = list_targets(&file).unwrap();
        assert_eq!(targets, vec![file.clone()]);
        let _ = std::fs::remove_file(&file);
    }

    #[test]
    fn reduction_is_skipped_at_the_rate_endpoints() {
        let mut settings = SplitlinkConfig::default().run.to_settings("r".into());
        settings.split_layer = 3;
        settings.pca_rate = 0.0;
        assert!(!reduction_active(&settings));
        settings.pca_rate = 1.0;
        assert!(!reduction_active(&settings));
        settings.pca_rate = 0.5;
        assert!(reduction_active(&settings));
        settings.split_layer = 0;
        assert!(!reduction_active(&settings));
    }
}
