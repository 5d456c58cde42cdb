//! Reception window — the receiver-side transfer state machine.
//!
//! Lifecycle: IDLE → ACCUMULATING → {COMPLETE | TIMED_OUT} → IDLE.
//!
//! A ResultSummary opens the window: it allocates the element buffer,
//! regenerates the permutation table from the summary's seed, and arms the
//! inactivity clock. Data packets scatter their elements into the buffer
//! through the permutation; the window completes the instant the reach
//! rate is met, or times out when the inactivity budget runs dry. A
//! timed-out window still yields its partial buffer — missing slots stay
//! zero. That is graceful degradation under loss, not an error.
//!
//! Only one window is active per role instance. Each open bumps an epoch
//! counter; a timeout watcher created for epoch N goes inert once the
//! window has moved on, so a stale watcher can never finalize the wrong
//! transfer. Packets arriving while idle (late duplicates after a terminal
//! transition included) are discarded without effect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use splitlink_core::envelope::ResultSummary;
use splitlink_core::packet;
use splitlink_core::permute::permutation;
use splitlink_core::settings::SplitMode;

/// How a transfer left the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// Reach rate met.
    SufficientData,
    /// Inactivity budget exhausted before the reach rate was met.
    TimeExceeded,
}

/// Reassembled transfer contents.
#[derive(Debug, Clone)]
pub enum WindowPayload {
    /// Byte-string mode: the re-joined raw bytes.
    Bytes(Vec<u8>),
    /// Numeric mode: the element buffer in original (pre-permutation)
    /// order. Unreceived slots are zero.
    Elements(Vec<f32>),
}

/// Per-transfer counters, reported when the window closes.
#[derive(Debug, Clone, Copy)]
pub struct TransferStats {
    pub packets_received: u32,
    pub elements_received: u64,
    pub element_count: u64,
    pub payload_bytes_received: u64,
}

impl TransferStats {
    pub fn receive_rate(&self) -> f64 {
        if self.element_count == 0 {
            return 0.0;
        }
        self.elements_received as f64 / self.element_count as f64
    }
}

/// Everything the relay needs to act on a finished transfer.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub kind: CompletionKind,
    pub summary: ResultSummary,
    pub payload: WindowPayload,
    pub stats: TransferStats,
}

// ── Internal state ────────────────────────────────────────────────────────────

enum Buffer {
    /// Armored chunks parked by sequence until the transfer closes.
    Bytes(Vec<Option<String>>),
    /// Scatter target plus the permutation that routes elements into it.
    /// `block_len` is the producer's block stride — element j of block i
    /// lands at `table[i * block_len + j]`.
    Elements {
        table: Vec<usize>,
        slots: Vec<f32>,
        block_len: usize,
    },
}

struct ActiveWindow {
    summary: ResultSummary,
    buffer: Buffer,
    seen: Vec<bool>,
    packets_received: u32,
    elements_received: u64,
    payload_bytes_received: u64,
    reach_rate: f64,
    wait_time: Duration,
    last_activity: Instant,
}

impl ActiveWindow {
    fn stats(&self) -> TransferStats {
        TransferStats {
            packets_received: self.packets_received,
            elements_received: self.elements_received,
            element_count: self.summary.num_elements,
            payload_bytes_received: self.payload_bytes_received,
        }
    }

    fn reach_met(&self) -> bool {
        match self.buffer {
            // Byte-string transfers only complete when everything arrived.
            Buffer::Bytes(_) => self.elements_received == self.summary.num_elements,
            Buffer::Elements { .. } => {
                self.summary.num_elements > 0
                    && self.elements_received as f64 / self.summary.num_elements as f64
                        >= self.reach_rate
            }
        }
    }

    fn finish(self, kind: CompletionKind) -> CompletedTransfer {
        let stats = self.stats();
        let payload = match self.buffer {
            Buffer::Bytes(chunks) => {
                // A timed-out byte transfer may have gaps; decode what came.
                match packet::join_bytes(&chunks) {
                    Ok(bytes) => WindowPayload::Bytes(bytes),
                    Err(error) => {
                        tracing::warn!(%error, "discarding undecodable byte chunks");
                        WindowPayload::Bytes(Vec::new())
                    }
                }
            }
            Buffer::Elements { slots, .. } => WindowPayload::Elements(slots),
        };
        CompletedTransfer {
            kind,
            summary: self.summary,
            payload,
            stats,
        }
    }
}

struct Inner {
    epoch: u64,
    active: Option<ActiveWindow>,
}

/// The shared window. TCP handler, UDP handler, and the timeout watcher
/// all reach it through this mutex — mutation is serialized, so the
/// counters and buffer can never tear.
pub struct ReceptionWindow {
    inner: Mutex<Inner>,
}

impl ReceptionWindow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                epoch: 0,
                active: None,
            }),
        })
    }

    /// IDLE → ACCUMULATING. Returns the epoch the caller hands to its
    /// timeout watcher. A still-active previous window is dropped — one
    /// window at a time, last summary wins.
    ///
    /// `block_len` must match the producer's packetizer stride
    /// ([`packet::SPLIT_BLOCK_ELEMENTS`] in production) — it is the shared
    /// constant both sides derive element positions from.
    pub async fn open(
        &self,
        summary: ResultSummary,
        split_mode: SplitMode,
        block_len: usize,
        reach_rate: f64,
        wait_time: Duration,
    ) -> u64 {
        let mut inner = self.inner.lock().await;
        if inner.active.is_some() {
            tracing::warn!("new summary while a window was active, dropping the old transfer");
        }

        let buffer = match &summary.shape {
            None => Buffer::Bytes(vec![None; summary.num_packets as usize]),
            Some(_) => {
                let n = summary.num_elements as usize;
                Buffer::Elements {
                    table: permutation(split_mode, summary.random_seed, n),
                    slots: vec![0.0; n],
                    block_len: block_len.max(1),
                }
            }
        };

        inner.epoch += 1;
        inner.active = Some(ActiveWindow {
            seen: vec![false; summary.num_packets as usize],
            summary,
            buffer,
            packets_received: 0,
            elements_received: 0,
            payload_bytes_received: 0,
            reach_rate,
            wait_time,
            last_activity: Instant::now(),
        });
        inner.epoch
    }

    /// Accept one data packet. Returns the completed transfer when this
    /// packet pushes the window over the reach rate; `None` while it is
    /// still accumulating, and `None` (without effect) for duplicates or
    /// packets arriving while idle.
    pub async fn accept(&self, sequence: u32, payload: &str) -> Option<CompletedTransfer> {
        let mut inner = self.inner.lock().await;
        let window = match inner.active.as_mut() {
            Some(w) => w,
            None => {
                tracing::debug!(sequence, "packet with no active window, discarding");
                return None;
            }
        };

        let seq = sequence as usize;
        if seq >= window.seen.len() {
            tracing::warn!(
                sequence,
                packets = window.summary.num_packets,
                "sequence out of range, discarding"
            );
            return None;
        }
        if window.seen[seq] {
            tracing::debug!(sequence, "duplicate packet, discarding");
            return None;
        }

        match &mut window.buffer {
            Buffer::Bytes(chunks) => {
                window.elements_received += payload.len() as u64;
                chunks[seq] = Some(payload.to_string());
            }
            Buffer::Elements {
                table,
                slots,
                block_len,
            } => {
                let elements = match packet::decode_block(payload) {
                    Ok(e) => e,
                    Err(error) => {
                        tracing::warn!(sequence, %error, "undecodable packet, discarding");
                        return None;
                    }
                };
                let base = seq * *block_len;
                for (j, &value) in elements.iter().enumerate() {
                    match table.get(base + j) {
                        Some(&pos) => slots[pos] = value,
                        None => {
                            tracing::warn!(sequence, "packet overruns element count, truncating");
                            break;
                        }
                    }
                }
                window.elements_received +=
                    elements.len().min(table.len().saturating_sub(base)) as u64;
            }
        }

        window.seen[seq] = true;
        window.packets_received += 1;
        window.payload_bytes_received += payload.len() as u64;
        window.last_activity = Instant::now();

        tracing::debug!(
            sequence,
            packets = window.packets_received,
            elements = window.elements_received,
            expected = window.summary.num_elements,
            "packet placed"
        );

        if window.reach_met() {
            return inner
                .active
                .take()
                .map(|window| window.finish(CompletionKind::SufficientData));
        }
        None
    }

    /// Fire the timeout transition if `epoch` is still the live window and
    /// its inactivity budget is spent. Stale epochs are inert.
    pub async fn check_timeout(&self, epoch: u64) -> TimeoutCheck {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return TimeoutCheck::Stale;
        }
        let expired = match inner.active.as_ref() {
            Some(window) => window.last_activity.elapsed() >= window.wait_time,
            None => return TimeoutCheck::Stale,
        };
        if !expired {
            return TimeoutCheck::StillAccumulating;
        }

        match inner.active.take() {
            Some(window) => {
                TimeoutCheck::TimedOut(Box::new(window.finish(CompletionKind::TimeExceeded)))
            }
            None => TimeoutCheck::Stale,
        }
    }

    /// True while a transfer is accumulating.
    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.active.is_some()
    }
}

/// Outcome of a watcher poll.
pub enum TimeoutCheck {
    /// The watched window already closed or was replaced — the watcher
    /// should exit.
    Stale,
    StillAccumulating,
    TimedOut(Box<CompletedTransfer>),
}

/// Watch one window's inactivity clock. Resolves with the timed-out
/// transfer, or `None` when the window closed by other means.
pub async fn watch_timeout(
    window: Arc<ReceptionWindow>,
    epoch: u64,
) -> Option<CompletedTransfer> {
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;
        match window.check_timeout(epoch).await {
            TimeoutCheck::Stale => return None,
            TimeoutCheck::StillAccumulating => {}
            TimeoutCheck::TimedOut(completed) => return Some(*completed),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use splitlink_core::packet::{encode_block, SPLIT_BLOCK_ELEMENTS};

    fn summary(num_packets: u32, num_elements: u64, shape: Option<Vec<usize>>) -> ResultSummary {
        ResultSummary {
            request_id: "req".into(),
            num_packets,
            num_elements,
            random_seed: 11,
            target: "t0".into(),
            shape,
        }
    }

    /// Split 100 elements into 10-element packets for the window tests.
    fn packets_of(values: &[f32], block: usize) -> Vec<String> {
        values.chunks(block).map(encode_block).collect()
    }

    #[tokio::test]
    async fn completes_at_reach_rate_without_waiting_for_the_rest() {
        let window = ReceptionWindow::new();
        let values: Vec<f32> = (0..100).map(|i| i as f32).collect();

        // 100 elements in 10 packets of 10, reach rate 0.8: packet 7 (the
        // 8th) must complete the window without waiting for the last two.
        let s = summary(10, 100, Some(vec![100]));
        window
            .open(s, SplitMode::Sequential, 10, 0.8, Duration::from_secs(60))
            .await;

        let chunks = packets_of(&values, 10);
        let mut completed = None;
        for (i, payload) in chunks.iter().enumerate().take(8) {
            let result = window.accept(i as u32, payload).await;
            if i < 7 {
                assert!(result.is_none(), "completed early at packet {i}");
            } else {
                completed = result;
            }
        }

        let completed = completed.expect("80 of 100 elements must complete at reach 0.8");
        assert_eq!(completed.kind, CompletionKind::SufficientData);
        assert_eq!(completed.stats.packets_received, 8);
        assert_eq!(completed.stats.elements_received, 80);
        assert!(!window.is_active().await);
    }

    #[tokio::test]
    async fn times_out_with_partial_zeroed_buffer() {
        let window = ReceptionWindow::new();
        let values: Vec<f32> = (1..=100).map(|i| i as f32).collect();
        let s = summary(10, 100, Some(vec![100]));
        let epoch = window
            .open(s, SplitMode::Sequential, 10, 0.8, Duration::from_millis(50))
            .await;

        // Only 50 of 100 elements arrive.
        for (i, payload) in packets_of(&values, 10).iter().enumerate().take(5) {
            assert!(window.accept(i as u32, payload).await.is_none());
        }

        let completed = watch_timeout(window.clone(), epoch)
            .await
            .expect("watcher must fire the timeout transition");
        assert_eq!(completed.kind, CompletionKind::TimeExceeded);
        assert_eq!(completed.stats.elements_received, 50);

        match completed.payload {
            WindowPayload::Elements(slots) => {
                assert_eq!(slots.len(), 100);
                // Identity permutation: first 50 slots placed, rest zero.
                assert!(slots[..50].iter().all(|&v| v != 0.0));
                assert!(slots[50..].iter().all(|&v| v == 0.0));
            }
            WindowPayload::Bytes(_) => panic!("expected element payload"),
        }
        assert!(!window.is_active().await);
    }

    #[tokio::test]
    async fn duplicate_after_complete_has_no_effect() {
        let window = ReceptionWindow::new();
        let values: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let s = summary(1, 10, Some(vec![10]));
        window
            .open(s, SplitMode::Sequential, 10, 1.0, Duration::from_secs(60))
            .await;

        let payload = encode_block(&values);
        let completed = window.accept(0, &payload).await;
        assert!(completed.is_some());
        assert!(!window.is_active().await);

        // Resend of sequence 0 after the terminal transition: discarded,
        // window stays idle.
        assert!(window.accept(0, &payload).await.is_none());
        assert!(!window.is_active().await);
    }

    #[tokio::test]
    async fn duplicate_while_accumulating_does_not_double_count() {
        let window = ReceptionWindow::new();
        let values: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let s = summary(2, 20, Some(vec![20]));
        window
            .open(s, SplitMode::Sequential, 10, 1.0, Duration::from_secs(60))
            .await;

        let payload = encode_block(&values);
        assert!(window.accept(0, &payload).await.is_none());
        // Same sequence again — reach rate math must not move.
        assert!(window.accept(0, &payload).await.is_none());
        assert!(window.is_active().await);
    }

    #[tokio::test]
    async fn random_mode_inverts_the_permutation() {
        let window = ReceptionWindow::new();
        let values: Vec<f32> = (0..3000).map(|i| i as f32 * 0.25).collect();
        let plan = splitlink_core::packet::split_elements(&values, SplitMode::Random, 77);
        assert_eq!(plan.packet_count, 2);

        let mut s = summary(plan.packet_count, plan.element_count, Some(vec![3000]));
        s.random_seed = 77;
        window
            .open(s, SplitMode::Random, SPLIT_BLOCK_ELEMENTS, 1.0, Duration::from_secs(60))
            .await;

        let mut completed = None;
        for p in &plan.packets {
            completed = window.accept(p.sequence, &p.payload).await;
        }
        match completed.expect("all packets delivered").payload {
            WindowPayload::Elements(slots) => assert_eq!(slots, values),
            WindowPayload::Bytes(_) => panic!("expected element payload"),
        }
    }

    #[tokio::test]
    async fn byte_mode_requires_every_chunk() {
        let window = ReceptionWindow::new();
        let data: Vec<u8> = (0u8..200).collect();
        let plan = splitlink_core::packet::split_bytes(&data, 64).unwrap();
        let s = summary(plan.packet_count, plan.element_count, None);
        // Byte mode ignores the configured reach rate.
        window
            .open(s, SplitMode::Sequential, SPLIT_BLOCK_ELEMENTS, 0.5, Duration::from_secs(60))
            .await;

        let mut completed = None;
        for (i, p) in plan.packets.iter().enumerate() {
            completed = window.accept(p.sequence, &p.payload).await;
            if i + 1 < plan.packets.len() {
                assert!(completed.is_none(), "byte mode completed before 100%");
            }
        }
        match completed.expect("full delivery completes").payload {
            WindowPayload::Bytes(bytes) => assert_eq!(bytes, data),
            WindowPayload::Elements(_) => panic!("expected byte payload"),
        }
    }

    #[tokio::test]
    async fn stale_watcher_is_inert_after_reopen() {
        let window = ReceptionWindow::new();
        let first = window
            .open(
                summary(1, 10, Some(vec![10])),
                SplitMode::Sequential,
                10,
                1.0,
                Duration::from_millis(10),
            )
            .await;
        // A second summary replaces the window before the watcher fires.
        let _second = window
            .open(
                summary(1, 10, Some(vec![10])),
                SplitMode::Sequential,
                10,
                1.0,
                Duration::from_secs(60),
            )
            .await;

        assert!(watch_timeout(window.clone(), first).await.is_none());
        assert!(window.is_active().await);
    }

    #[tokio::test]
    async fn out_of_range_sequence_is_discarded() {
        let window = ReceptionWindow::new();
        window
            .open(
                summary(1, 10, Some(vec![10])),
                SplitMode::Sequential,
                10,
                1.0,
                Duration::from_secs(60),
            )
            .await;
        let payload = encode_block(&[1.0; 10]);
        assert!(window.accept(5, &payload).await.is_none());
        assert!(window.is_active().await);
    }
}
