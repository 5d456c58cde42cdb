//! Splitlink end-to-end harness.
//!
//! Runs the source and relay endpoints as in-process tasks over loopback
//! sockets, with the test itself playing the controller: it pushes the
//! run settings, collects the relay's inference result, and cascades the
//! termination commands. Ports are freshly allocated per test so the
//! tests can run in parallel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use splitlink_core::config::SplitlinkConfig;
use splitlink_core::envelope::{new_request_id, Plain, SettingsPush};
use splitlink_core::{
    codec, QuantScheme, Request, Response, Settings, SplitMode, Tensor, Transport,
};
use splitlink_services::{relay, source, InferenceEngine, MockEngine};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Reserve a free loopback TCP port.
fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().unwrap().port()
}

/// Reserve a free loopback UDP port.
fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind ephemeral port");
    socket.local_addr().unwrap().port()
}

/// A fresh loopback topology: config, input file, and spawned role tasks.
struct Topology {
    config: SplitlinkConfig,
    input_file: PathBuf,
    source_task: JoinHandle<Result<()>>,
    relay_task: JoinHandle<Result<()>>,
    controller_task: JoinHandle<()>,
    results: mpsc::Receiver<(String, String)>,
}

impl Topology {
    fn source_addr(&self) -> String {
        format!("127.0.0.1:{}", self.config.network.source_port)
    }

    fn relay_addr(&self) -> String {
        format!("127.0.0.1:{}", self.config.network.relay_port)
    }

    async fn shutdown(mut self) {
        send_request(
            &self.source_addr(),
            &Request::SourceEnd(Plain {
                request_id: new_request_id(),
            }),
        )
        .await
        .expect("source termination");
        send_request(
            &self.relay_addr(),
            &Request::RelayEnd(Plain {
                request_id: new_request_id(),
            }),
        )
        .await
        .expect("relay termination");

        tokio::time::timeout(Duration::from_secs(5), self.source_task)
            .await
            .expect("source task must exit after its end command")
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.relay_task)
            .await
            .expect("relay task must exit after its end command")
            .unwrap()
            .unwrap();

        self.controller_task.abort();
        self.results.close();
        let _ = std::fs::remove_file(&self.input_file);
    }
}

/// One request/response exchange, mirroring the roles' own transport: one
/// envelope per connection, write then half-close, read to EOF.
async fn send_request(addr: &str, request: &Request) -> Result<Response> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect {addr}"))?;
    stream.write_all(&request.encode()?).await?;
    stream.shutdown().await?;

    let mut body = Vec::new();
    stream.read_to_end(&mut body).await?;
    Ok(Response::decode(&body)?)
}

/// Retry a request until the listener is up. Bounds test startup races.
async fn send_with_patience(addr: &str, request: &Request) -> Result<Response> {
    let mut last = None;
    for _ in 0..50 {
        match send_request(addr, request).await {
            Ok(response) => return Ok(response),
            Err(error) => {
                last = Some(error);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    Err(last.unwrap())
}

/// Minimal controller: acks everything, forwards inference results.
async fn controller_stub(listener: TcpListener, results: mpsc::Sender<(String, String)>) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut body = Vec::new();
        if stream.read_to_end(&mut body).await.is_err() {
            continue;
        }
        let Ok(request) = Request::decode(&body) else {
            continue;
        };

        if let Request::RelayInferenceResult(result) = &request {
            let _ = results
                .send((result.target.clone(), result.result.clone()))
                .await;
        }
        let response = Response::ok(request.request_id());
        if let Ok(bytes) = response.encode() {
            let _ = stream.write_all(&bytes).await;
        }
        let _ = stream.shutdown().await;
    }
}

/// Deterministic input bytes for one target. Sized so a split at layer 3
/// yields 8000 activations — exactly four full packets.
fn input_bytes() -> Vec<u8> {
    (0..64_000).map(|i| ((i * 31) % 251) as u8).collect()
}

async fn start_topology(name: &str) -> Topology {
    let mut config = SplitlinkConfig::default();
    config.network.source_port = free_tcp_port();
    config.network.relay_port = free_tcp_port();
    config.network.relay_udp_port = free_udp_port();
    config.network.controller_port = free_tcp_port();

    let input_file = std::env::temp_dir().join(format!(
        "splitlink-e2e-{name}-{}.bin",
        std::process::id()
    ));
    std::fs::write(&input_file, input_bytes()).unwrap();
    config.run.input_path = input_file.to_string_lossy().into_owned();

    let controller_listener =
        TcpListener::bind(format!("127.0.0.1:{}", config.network.controller_port))
            .await
            .expect("controller stub bind");
    let (results_tx, results) = mpsc::channel(16);
    let controller_task = tokio::spawn(controller_stub(controller_listener, results_tx));

    let source_engine: Arc<dyn InferenceEngine> = Arc::new(MockEngine::default());
    let relay_engine: Arc<dyn InferenceEngine> = Arc::new(MockEngine::default());
    let source_task = tokio::spawn(source::run(config.clone(), source_engine));
    let relay_task = tokio::spawn(relay::run(config.clone(), relay_engine));

    Topology {
        config,
        input_file,
        source_task,
        relay_task,
        controller_task,
        results,
    }
}

/// Push the settings to relay then source, as the controller does.
async fn push_settings(topology: &Topology, settings: &Settings) {
    for (addr, request) in [
        (
            topology.relay_addr(),
            Request::SettingsToRelay(SettingsPush {
                request_id: new_request_id(),
                settings: settings.clone(),
            }),
        ),
        (
            topology.source_addr(),
            Request::SettingsToSource(SettingsPush {
                request_id: new_request_id(),
                settings: settings.clone(),
            }),
        ),
    ] {
        let response = send_with_patience(&addr, &request)
            .await
            .expect("settings push");
        assert_eq!(u16::from(response.code), 0, "settings push must be acked");
    }
}

/// What the pipeline should classify: front half, quantize round-trip,
/// back half — the same lossy path the wire takes.
fn expected_class(settings: &Settings) -> String {
    let engine = MockEngine::default();
    let model = engine.load_model(&settings.model).unwrap();
    let input = engine.decode_input(&input_bytes()).unwrap();

    let scores = if settings.split_layer == 0 {
        engine
            .run_slice(&model, 1, model.layer_count, &input)
            .unwrap()
    } else {
        let inter = engine
            .run_slice(&model, 1, settings.split_layer, &input)
            .unwrap();
        let codes = codec::encode(&inter, settings.quant).unwrap();
        let values = codec::decode(&codes, settings.quant);
        let tensor = Tensor::new(inter.shape().to_vec(), values).unwrap();
        engine
            .run_slice(&model, settings.split_layer + 1, model.layer_count, &tensor)
            .unwrap()
    };
    scores.argmax().unwrap().to_string()
}

async fn expect_result(topology: &mut Topology) -> (String, String) {
    tokio::time::timeout(Duration::from_secs(15), topology.results.recv())
        .await
        .expect("inference result must arrive before the test deadline")
        .expect("results channel closed early")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Sequential split over TCP: four packets, the window completes exactly
/// on the last one (never times out), and the relay reports the same
/// class the unsplit pipeline yields.
#[tokio::test]
async fn tcp_sequential_end_to_end() {
    let mut topology = start_topology("tcp-seq").await;

    let mut settings = topology.config.run.to_settings("run-e2e-tcp".into());
    settings.split_layer = 3;
    settings.split_mode = SplitMode::Sequential;
    settings.quant = QuantScheme::Q16;
    settings.transport = Transport::Tcp;
    settings.reach_rate = 1.0;
    settings.wait_time_ms = 3000;
    push_settings(&topology, &settings).await;

    let (target, result) = expect_result(&mut topology).await;
    assert!(topology.input_file.to_string_lossy().contains(&target));
    assert_eq!(result, expected_class(&settings));

    topology.shutdown().await;
}

/// Random split over UDP: the relay regenerates the permutation from the
/// summary's seed and inverts it.
#[tokio::test]
async fn udp_random_end_to_end() {
    let mut topology = start_topology("udp-rand").await;

    let mut settings = topology.config.run.to_settings("run-e2e-udp".into());
    settings.split_layer = 2;
    settings.split_mode = SplitMode::Random;
    settings.random_seed = 777;
    settings.quant = QuantScheme::Q8;
    settings.transport = Transport::Udp;
    settings.reach_rate = 1.0;
    settings.wait_time_ms = 3000;
    push_settings(&topology, &settings).await;

    let (_, result) = expect_result(&mut topology).await;
    assert_eq!(result, expected_class(&settings));

    topology.shutdown().await;
}

/// Split layer 0: raw bytes travel in byte-string mode and the relay runs
/// the whole model.
#[tokio::test]
async fn byte_mode_layer_zero_end_to_end() {
    let mut topology = start_topology("byte-mode").await;

    let mut settings = topology.config.run.to_settings("run-e2e-bytes".into());
    settings.split_layer = 0;
    settings.max_packet_bytes = 4096;
    settings.transport = Transport::Tcp;
    settings.wait_time_ms = 3000;
    push_settings(&topology, &settings).await;

    let (_, result) = expect_result(&mut topology).await;
    assert_eq!(result, expected_class(&settings));

    topology.shutdown().await;
}

/// Back-to-back runs reuse the same listeners: a second settings push and
/// transfer must work without restarting the roles.
#[tokio::test]
async fn two_runs_on_one_topology() {
    let mut topology = start_topology("two-runs").await;

    let mut settings = topology.config.run.to_settings("run-e2e-a".into());
    settings.split_layer = 3;
    settings.quant = QuantScheme::None;
    settings.wait_time_ms = 3000;
    push_settings(&topology, &settings).await;
    let (_, first) = expect_result(&mut topology).await;

    let mut settings_b = settings.clone();
    settings_b.run_id = "run-e2e-b".into();
    settings_b.split_mode = SplitMode::Random;
    settings_b.random_seed = 31;
    push_settings(&topology, &settings_b).await;
    let (_, second) = expect_result(&mut topology).await;

    // Same input, both transfers lossless — identical classification.
    assert_eq!(first, second);
    assert_eq!(first, expected_class(&settings));

    topology.shutdown().await;
}
