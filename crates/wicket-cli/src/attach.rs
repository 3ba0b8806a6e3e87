//! Raw-mode terminal attachment for a pane
//!
//! Forwards local keystrokes to the pane's channel and writes channel
//! output to the local terminal. Ctrl+] detaches. The scroll marker is
//! updated as output arrives so a later reconnect can resume without
//! re-rendering lines the user has already seen.

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::sync::mpsc;

use wicket_core::layout::ScrollMarker;
use wicket_core::traits::{Channel, ChannelEvent};
use wicket_core::types::{PaneId, TermSize};
use wicket_gate::Gate;

/// Ctrl+] detaches, as in telnet
const DETACH_BYTE: u8 = 0x1d;

/// Attach the local terminal to a pane until detach or channel close
pub async fn attach(gate: &Gate, pane: PaneId) -> Result<()> {
    // Match the pane to the local terminal before binding I/O
    if let Ok((columns, rows)) = crossterm::terminal::size() {
        let _ = gate.resize_pane(pane, TermSize::new(columns, rows)).await;
    }

    let channel = gate
        .pane_channel(pane)
        .await
        .context("pane is not bound to a channel")?;
    let mut events = gate
        .take_pane_events(pane)
        .await
        .context("pane output already subscribed")?;

    enable_raw_mode().context("failed to enter raw mode")?;
    let result = run(gate, pane, channel, &mut events).await;
    let _ = disable_raw_mode();
    result
}

async fn run(
    gate: &Gate,
    pane: PaneId,
    channel: Arc<dyn Channel>,
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
) -> Result<()> {
    // Blocking stdin reader feeding the event loop
    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut lines_seen: u64 = gate.pane_marker(pane).await.map(|m| m.line).unwrap_or(0);
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            input = stdin_rx.recv() => {
                let Some(input) = input else { break };
                if let Some(at) = input.iter().position(|b| *b == DETACH_BYTE) {
                    if at > 0 {
                        channel.send(&input[..at]);
                    }
                    break;
                }
                channel.send(&input);
            }
            event = events.recv() => {
                match event {
                    Some(ChannelEvent::Data(data)) => {
                        lines_seen += data.iter().filter(|b| **b == b'\n').count() as u64;
                        stdout.write_all(&data)?;
                        stdout.flush()?;
                    }
                    Some(ChannelEvent::Closed) | None => break,
                }
            }
        }
    }

    // Remember how far the user has seen for the next attach
    gate.set_marker(pane, ScrollMarker::at(lines_seen)).await;
    Ok(())
}
