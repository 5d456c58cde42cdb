//! Network-condition wrapper around the external `tc` tool.
//!
//! Shaping is applied on a role's egress device when settings arrive and
//! cleared when the run ends. The emulation itself is `tc`'s business —
//! this module only builds the command lines. All-zero shaping parameters
//! are a no-op in both directions, and a failed `tc qdisc add` (qdisc already
//! installed) falls back to `tc qdisc change`. Shaping failures are
//! logged, never fatal: a run on an unshaped link is still a valid run.

use anyhow::{Context, Result};
use tokio::process::Command;

use splitlink_core::LinkShaping;

/// Install the shaping parameters on `device`.
pub async fn apply(device: &str, shaping: &LinkShaping) -> Result<()> {
    if device.is_empty() || shaping.is_unshaped() {
        tracing::debug!(device, "link shaping skipped");
        return Ok(());
    }

    let netem = netem_args(shaping);
    let status = run_tc(&["qdisc", "add", "dev", device, "root", "handle", "1:0"], &netem).await?;
    if !status {
        // add fails when a qdisc is already installed — change it instead.
        tracing::info!(device, "tc add failed, changing existing qdisc");
        run_tc(&["qdisc", "change", "dev", device, "root", "handle", "1:0"], &netem).await?;
    }

    tracing::info!(
        device,
        delay_ms = shaping.delay_ms,
        jitter_ms = shaping.jitter_ms,
        loss_rate = shaping.loss_rate,
        bandwidth_mbit = shaping.bandwidth_mbit,
        "link shaping applied"
    );
    Ok(())
}

/// Remove shaping from `device`. A no-op when the spec was all-zero.
pub async fn clear(device: &str, shaping: &LinkShaping) -> Result<()> {
    if device.is_empty() || shaping.is_unshaped() {
        tracing::debug!(device, "link shaping reset unneeded");
        return Ok(());
    }
    run_tc(&["qdisc", "del", "dev", device, "root"], &[]).await?;
    tracing::info!(device, "link shaping cleared");
    Ok(())
}

/// The netem parameter tail of the command line.
fn netem_args(shaping: &LinkShaping) -> Vec<String> {
    let mut args = vec!["netem".to_string()];
    if shaping.delay_ms != 0.0 {
        args.push("delay".into());
        args.push(format!("{}ms", shaping.delay_ms));
        if shaping.jitter_ms != 0.0 {
            args.push(format!("{}ms", shaping.jitter_ms));
        }
    }
    if shaping.loss_rate != 0.0 {
        args.push("loss".into());
        args.push(format!("{}%", shaping.loss_rate * 100.0));
    }
    if shaping.bandwidth_mbit != 0.0 {
        args.push("rate".into());
        args.push(format!("{}mbit", shaping.bandwidth_mbit));
    }
    args
}

/// Run one `tc` invocation; returns whether it exited successfully.
async fn run_tc(head: &[&str], tail: &[String]) -> Result<bool> {
    let mut command = Command::new("tc");
    command.args(head);
    command.args(tail);
    let output = command
        .output()
        .await
        .with_context(|| format!("failed to spawn tc {head:?}"))?;
    if !output.status.success() {
        tracing::debug!(
            args = ?head,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "tc exited non-zero"
        );
    }
    Ok(output.status.success())
}
