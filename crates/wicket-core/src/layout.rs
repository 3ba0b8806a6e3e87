//! Serializable gate layout snapshots
//!
//! A snapshot captures a gate's window/pane geometry plus a per-pane scroll
//! marker. It is the only state shared between the restore-from-disk and
//! restore-from-remote paths, so writers replace it wholesale; there is no
//! partial mutation API.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::types::TermSize;

/// Scroll-continuity marker for a pane.
///
/// Identifies the last line the user has already seen, so reconnect can
/// resume output without re-rendering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollMarker {
    /// Absolute line counter at the last rendered line
    pub line: u64,
}

impl ScrollMarker {
    /// Marker at a given line
    pub fn at(line: u64) -> Self {
        Self { line }
    }
}

/// Persisted description of one pane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaneLayout {
    /// Terminal columns at snapshot time
    pub columns: u16,
    /// Terminal rows at snapshot time
    pub rows: u16,
    /// Command the pane's shell was started with
    pub command: String,
    /// Scroll marker, if any output has been rendered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<ScrollMarker>,
}

impl PaneLayout {
    /// Pane geometry as a [`TermSize`]
    pub fn size(&self) -> TermSize {
        TermSize::new(self.columns, self.rows)
    }
}

/// Persisted description of one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowLayout {
    /// Panes in layout order
    pub panes: Vec<PaneLayout>,
}

/// Full layout snapshot of a gate
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LayoutSnapshot {
    /// Windows in layout order
    pub windows: Vec<WindowLayout>,
}

impl LayoutSnapshot {
    /// Snapshot with a single window holding one default pane
    pub fn single_pane(command: impl Into<String>, size: TermSize) -> Self {
        Self {
            windows: vec![WindowLayout {
                panes: vec![PaneLayout {
                    columns: size.columns,
                    rows: size.rows,
                    command: command.into(),
                    marker: None,
                }],
            }],
        }
    }

    /// Total number of panes across all windows
    pub fn pane_count(&self) -> usize {
        self.windows.iter().map(|w| w.panes.len()).sum()
    }

    /// Whether the snapshot describes no panes at all
    pub fn is_empty(&self) -> bool {
        self.pane_count() == 0
    }

    /// Serialize for the out-of-band layout payload
    pub fn to_json(&self) -> Result<String, SessionError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an out-of-band layout payload
    pub fn from_json(data: &str) -> Result<Self, SessionError> {
        Ok(serde_json::from_str(data)?)
    }
}
