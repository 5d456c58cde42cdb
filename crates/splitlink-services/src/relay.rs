//! Relay role — receives the packet stream, reassembles it, and finishes
//! the inference.
//!
//! Three long-lived tasks share the reception window: the TCP control
//! listener, the UDP data listener, and the completion consumer. Each
//! summary additionally spawns a short-lived timeout watcher that dies
//! with its window's epoch. Both terminal transitions funnel into one
//! completion channel, so the notify/infer/report pipeline runs in exactly
//! one place regardless of how the window closed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};

use splitlink_core::config::SplitlinkConfig;
use splitlink_core::envelope::{
    new_request_id, InferenceResult, Plain, ProcessTime, ReceivedResult,
};
use splitlink_core::packet::SPLIT_BLOCK_ELEMENTS;
use splitlink_core::reduce::{PcaReduction, ReductionCodec};
use splitlink_core::{codec, Request, Response, ResponseCode, Settings, Tensor};

use crate::engine::{InferenceEngine, ModelHandle};
use crate::net;
use crate::netem;
use crate::retry::RetryPolicy;
use crate::window::{
    watch_timeout, CompletedTransfer, CompletionKind, ReceptionWindow, WindowPayload,
};

/// UDP read timeout before any settings arrive. Once a run's wait time is
/// known the timeout widens to `wait_time + 5s` so the socket cannot time
/// out mid-transfer.
const INITIAL_UDP_TIMEOUT: Duration = Duration::from_secs(5);
const UDP_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

struct RelayState {
    config: SplitlinkConfig,
    engine: Arc<dyn InferenceEngine>,
    model: Mutex<Option<ModelHandle>>,
    settings: RwLock<Option<Settings>>,
    window: Arc<ReceptionWindow>,
    completions: mpsc::Sender<CompletedTransfer>,
    udp_timeout: watch::Sender<Duration>,
}

impl RelayState {
    fn source_addr(&self) -> String {
        format!(
            "{}:{}",
            self.config.network.source_host, self.config.network.source_port
        )
    }

    fn controller_addr(&self) -> String {
        format!(
            "{}:{}",
            self.config.network.controller_host, self.config.network.controller_port
        )
    }
}

/// Run the relay endpoint until its termination command arrives.
pub async fn run(config: SplitlinkConfig, engine: Arc<dyn InferenceEngine>) -> Result<()> {
    let tcp_bind = format!("{}:{}", config.network.relay_host, config.network.relay_port);
    let udp_bind = format!(
        "{}:{}",
        config.network.relay_host, config.network.relay_udp_port
    );

    let listener = TcpListener::bind(&tcp_bind)
        .await
        .with_context(|| format!("relay failed to bind {tcp_bind}"))?;
    let udp_socket = UdpSocket::bind(&udp_bind)
        .await
        .with_context(|| format!("relay failed to bind {udp_bind}"))?;
    tracing::info!(tcp = %tcp_bind, udp = %udp_bind, "relay listening");

    let (completion_tx, completion_rx) = mpsc::channel::<CompletedTransfer>(8);
    let (udp_timeout_tx, udp_timeout_rx) = watch::channel(INITIAL_UDP_TIMEOUT);

    let state = Arc::new(RelayState {
        config,
        engine,
        model: Mutex::new(None),
        settings: RwLock::new(None),
        window: ReceptionWindow::new(),
        completions: completion_tx,
        udp_timeout: udp_timeout_tx,
    });

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            let _ = shutdown.send(());
        });
    }

    let udp_task = tokio::spawn(udp_loop(
        udp_socket,
        state.clone(),
        udp_timeout_rx,
        shutdown_tx.subscribe(),
    ));

    let consumer_task = tokio::spawn(completion_loop(
        completion_rx,
        state.clone(),
        shutdown_tx.subscribe(),
    ));

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("relay shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("relay accept failed")?;
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

    udp_task.await.ok();
    consumer_task.await.ok();

    let settings = state.settings.read().await.clone();
    if let Some(settings) = settings {
        if let Err(error) =
            netem::clear(&state.config.network.relay_device, &settings.relay_link).await
        {
            tracing::warn!(%error, "relay link shaping reset failed");
        }
    }
    Ok(())
}

// ── Control plane ─────────────────────────────────────────────────────────────

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    state: Arc<RelayState>,
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
        Request::SettingsToRelay(push) => {
            tracing::info!(run_id = %push.settings.run_id, "settings received");

            // Widen the UDP timeout past the transfer wait budget.
            let wait = Duration::from_millis(push.settings.wait_time_ms) + UDP_TIMEOUT_MARGIN;
            let _ = state.udp_timeout.send(wait);

            if let Err(error) = netem::apply(
                &state.config.network.relay_device,
                &push.settings.relay_link,
            )
            .await
            {
                tracing::warn!(%error, "relay link shaping failed");
            }

            *state.settings.write().await = Some(push.settings);
            net::respond(&mut stream, &Response::ok(&push.request_id)).await?;
        }
        Request::ResultSummary(summary) => {
            let Some(settings) = state.settings.read().await.clone() else {
                tracing::warn!("summary before settings, closing connection");
                return Ok(());
            };
            let request_id = summary.request_id.clone();
            open_window(&state, summary, &settings).await;
            net::respond(&mut stream, &Response::ok(&request_id)).await?;
        }
        Request::ResultData(data) => {
            let request_id = data.request_id.clone();
            if let Some(completed) = state.window.accept(data.sequence, &data.payload).await {
                let _ = state.completions.send(completed).await;
            }
            net::respond(&mut stream, &Response::ok(&request_id)).await?;
        }
        Request::RelayEnd(Plain { request_id }) => {
            tracing::info!("termination command received");
            net::respond(&mut stream, &Response::ok(&request_id)).await?;
            let _ = shutdown.send(());
        }
        other => {
            tracing::warn!(command = ?other.command(), "command not handled by relay");
        }
    }
    Ok(())
}

async fn open_window(
    state: &Arc<RelayState>,
    summary: splitlink_core::envelope::ResultSummary,
    settings: &Settings,
) {
    tracing::info!(
        target = %summary.target,
        packets = summary.num_packets,
        elements = summary.num_elements,
        "transfer announced"
    );

    let epoch = state
        .window
        .open(
            summary,
            settings.split_mode,
            SPLIT_BLOCK_ELEMENTS,
            settings.reach_rate,
            Duration::from_millis(settings.wait_time_ms),
        )
        .await;

    // Watcher for this window's inactivity clock; inert once the epoch
    // moves on.
    let window = state.window.clone();
    let completions = state.completions.clone();
    tokio::spawn(async move {
        if let Some(completed) = watch_timeout(window, epoch).await {
            let _ = completions.send(completed).await;
        }
    });
}

// ── Data plane ────────────────────────────────────────────────────────────────

async fn udp_loop(
    socket: UdpSocket,
    state: Arc<RelayState>,
    timeout: watch::Receiver<Duration>,
    mut shutdown: broadcast::Receiver<()>,
) {
    // One envelope per datagram; 64 KiB covers the largest UDP payload.
    let mut buf = vec![0u8; 65536];
    loop {
        let wait = *timeout.borrow();
        let datagram = tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("udp listener shutting down");
                return;
            }
            received = tokio::time::timeout(wait, socket.recv_from(&mut buf)) => received,
        };

        let (len, peer) = match datagram {
            Err(_) => {
                tracing::debug!("udp read timeout");
                continue;
            }
            Ok(Err(error)) => {
                tracing::warn!(%error, "udp receive failed");
                continue;
            }
            Ok(Ok(ok)) => ok,
        };

        let request = match Request::decode(&buf[..len]) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(%peer, %error, "malformed datagram, ignoring");
                continue;
            }
        };

        // The data plane only ever carries packets; no response is sent.
        match request {
            Request::ResultData(data) => {
                if let Some(completed) = state.window.accept(data.sequence, &data.payload).await {
                    let _ = state.completions.send(completed).await;
                }
            }
            other => {
                tracing::debug!(command = ?other.command(), "non-data command on udp, ignoring");
            }
        }
    }
}

// ── Completion pipeline ───────────────────────────────────────────────────────

async fn completion_loop(
    mut completions: mpsc::Receiver<CompletedTransfer>,
    state: Arc<RelayState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let completed = tokio::select! {
            _ = shutdown.recv() => return,
            completed = completions.recv() => match completed {
                Some(completed) => completed,
                None => return,
            },
        };

        if let Err(error) = handle_completion(&state, completed).await {
            tracing::error!(%error, "completion handling failed");
        }
    }
}

async fn handle_completion(state: &Arc<RelayState>, completed: CompletedTransfer) -> Result<()> {
    let stats = completed.stats;
    tracing::info!(
        target = %completed.summary.target,
        kind = ?completed.kind,
        packets = stats.packets_received,
        elements = stats.elements_received,
        expected = stats.element_count,
        rate = stats.receive_rate(),
        bytes = stats.payload_bytes_received,
        "transfer closed"
    );

    let settings = state
        .settings
        .read()
        .await
        .clone()
        .context("transfer completed without settings")?;
    let retry = RetryPolicy::new(state.config.run.max_retries);

    // Tell the source to stop streaming this target.
    let ack_code = match completed.kind {
        CompletionKind::SufficientData => ResponseCode::SufficientData,
        CompletionKind::TimeExceeded => ResponseCode::TimeExceeded,
    };
    let source_addr = state.source_addr();
    retry
        .run("send-received-result", || {
            let request = Request::ReceivedResult(ReceivedResult {
                request_id: new_request_id(),
                code: ack_code,
            });
            let addr = source_addr.clone();
            async move { net::request(&addr, &request).await.map(|_| ()) }
        })
        .await?;

    let target = completed.summary.target.clone();
    report_process_time(state, format!("relay:inference:start:{target}")).await;
    let label = finish_inference(state, &settings, completed).await?;
    report_process_time(state, format!("relay:inference:end:{target}")).await;
    tracing::info!(%target, result = %label, "inference finished");

    // Report the classification upstream.
    let controller_addr = state.controller_addr();
    retry
        .run("send-inference-result", || {
            let request = Request::RelayInferenceResult(InferenceResult {
                request_id: new_request_id(),
                result: label.clone(),
                target: target.clone(),
            });
            let addr = controller_addr.clone();
            async move { net::request(&addr, &request).await.map(|_| ()) }
        })
        .await?;
    Ok(())
}

/// Decode the reassembled buffer and run the back half of the model.
async fn finish_inference(
    state: &Arc<RelayState>,
    settings: &Settings,
    completed: CompletedTransfer,
) -> Result<String> {
    let model = load_model(state, settings).await?;

    let scores = match completed.payload {
        WindowPayload::Bytes(bytes) => {
            // Split layer 0: the relay runs the whole model on the raw
            // input.
            let input = state.engine.decode_input(&bytes)?;
            state
                .engine
                .run_slice(&model, 1, model.layer_count, &input)?
        }
        WindowPayload::Elements(codes) => {
            let values = codec::decode(&codes, settings.quant);
            let shape = completed
                .summary
                .shape
                .clone()
                .context("numeric transfer without a declared shape")?;
            let mut tensor = Tensor::new(shape, values)?;

            if settings.pca_rate != 0.0 && settings.pca_rate != 1.0 {
                let reduction = PcaReduction::load(
                    &state.config.paths.basis_dir,
                    &settings.model,
                    settings.split_layer,
                )?;
                tensor = reduction.reconstruct(&tensor)?;
            }

            state
                .engine
                .run_slice(&model, settings.split_layer + 1, model.layer_count, &tensor)?
        }
    };

    let class = scores.argmax().context("empty score tensor")?;
    Ok(class.to_string())
}

async fn load_model(state: &Arc<RelayState>, settings: &Settings) -> Result<ModelHandle> {
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

async fn report_process_time(state: &Arc<RelayState>, process_name: String) {
    let request = Request::RelayProcessTime(ProcessTime {
        request_id: new_request_id(),
        process_name,
        process_time: crate::unix_time_secs(),
    });
    if let Err(error) = net::request(&state.controller_addr(), &request).await {
        tracing::debug!(%error, "process-time report failed");
    }
}
