//! The window/pane tree owned by a gate
//!
//! Structural operations (split, close, resize) are independent of session
//! state: panes exist whether or not a channel is bound to them. A pane's
//! channel binding is an index entry, a `(channel id, generation)` tag,
//! never an owning reference; the live channel handles belong to the gate
//! and die with the session that produced them.

use wicket_core::layout::{LayoutSnapshot, PaneLayout, ScrollMarker, WindowLayout};
use wicket_core::types::{ChannelId, Generation, PaneId, TermSize, WindowId};

/// Channel binding tag for a pane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Channel within the session of the tagged generation
    pub channel: ChannelId,
    /// Session generation that produced the channel
    pub generation: Generation,
}

/// A single terminal view
#[derive(Debug)]
pub struct Pane {
    /// Pane identifier, stable across reconnects
    pub id: PaneId,
    /// Current geometry
    pub size: TermSize,
    /// Command spawned in this pane's shell (empty = login shell)
    pub command: String,
    /// Scroll-continuity marker
    pub marker: Option<ScrollMarker>,
    /// Current channel binding, if any
    pub binding: Option<Binding>,
}

/// A window holding one or more panes
#[derive(Debug)]
pub struct Window {
    /// Window identifier
    pub id: WindowId,
    /// Panes in layout order
    pub panes: Vec<Pane>,
}

/// The gate's window/pane tree with active pointers
#[derive(Debug, Default)]
pub struct PaneTree {
    windows: Vec<Window>,
    active_window: Option<WindowId>,
    active_pane: Option<PaneId>,
    next_window: u32,
    next_pane: u32,
}

impl PaneTree {
    /// Empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Tree with a single window holding one pane
    pub fn fresh(command: impl Into<String>, size: TermSize) -> Self {
        let mut tree = Self::new();
        let window = tree.add_window();
        tree.add_pane(window, command.into(), size);
        tree
    }

    /// Reconstruct a tree from a layout snapshot
    pub fn from_snapshot(snapshot: &LayoutSnapshot) -> Self {
        let mut tree = Self::new();
        for window_layout in &snapshot.windows {
            let window = tree.add_window();
            for pane_layout in &window_layout.panes {
                let pane = tree.add_pane(window, pane_layout.command.clone(), pane_layout.size());
                if let Some(pane) = tree.pane_mut(pane) {
                    pane.marker = pane_layout.marker;
                }
            }
        }
        tree
    }

    /// Capture the current layout. Bindings are deliberately not part of a
    /// snapshot; they are meaningless outside the producing session.
    pub fn snapshot(&self) -> LayoutSnapshot {
        LayoutSnapshot {
            windows: self
                .windows
                .iter()
                .map(|window| WindowLayout {
                    panes: window
                        .panes
                        .iter()
                        .map(|pane| PaneLayout {
                            columns: pane.size.columns,
                            rows: pane.size.rows,
                            command: pane.command.clone(),
                            marker: pane.marker,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Append an empty window
    pub fn add_window(&mut self) -> WindowId {
        self.next_window += 1;
        let id = WindowId::new(self.next_window);
        self.windows.push(Window { id, panes: vec![] });
        if self.active_window.is_none() {
            self.active_window = Some(id);
        }
        id
    }

    /// Append a pane to a window
    pub fn add_pane(
        &mut self,
        window: WindowId,
        command: impl Into<String>,
        size: TermSize,
    ) -> PaneId {
        self.next_pane += 1;
        let id = PaneId::new(self.next_pane);
        if let Some(window) = self.windows.iter_mut().find(|w| w.id == window) {
            window.panes.push(Pane {
                id,
                size,
                command: command.into(),
                marker: None,
                binding: None,
            });
        }
        if self.active_pane.is_none() {
            self.active_pane = Some(id);
        }
        id
    }

    /// Split a pane: create a sibling with the same geometry and command.
    /// Purely structural; the new pane starts unbound.
    pub fn split_pane(&mut self, pane: PaneId) -> Option<PaneId> {
        let window = self.windows.iter().find(|w| w.panes.iter().any(|p| p.id == pane))?;
        let window_id = window.id;
        let source = window.panes.iter().find(|p| p.id == pane)?;
        let (command, size) = (source.command.clone(), source.size);
        let id = self.add_pane(window_id, command, size);
        self.active_window = Some(window_id);
        self.active_pane = Some(id);
        Some(id)
    }

    /// Remove a pane; a window emptied by this is removed too. Returns the
    /// pane's binding, if it had one, so the caller can close the channel.
    pub fn close_pane(&mut self, pane: PaneId) -> Option<Option<Binding>> {
        let window_index = self
            .windows
            .iter()
            .position(|w| w.panes.iter().any(|p| p.id == pane))?;
        let window = &mut self.windows[window_index];
        let pane_index = window.panes.iter().position(|p| p.id == pane)?;
        let removed = window.panes.remove(pane_index);

        if window.panes.is_empty() {
            let removed_window = self.windows.remove(window_index).id;
            if self.active_window == Some(removed_window) {
                self.active_window = self.windows.first().map(|w| w.id);
            }
        }
        if self.active_pane == Some(pane) {
            self.active_pane = self
                .windows
                .iter()
                .flat_map(|w| w.panes.iter())
                .next()
                .map(|p| p.id);
        }
        Some(removed.binding)
    }

    /// Bind a pane to a channel of the given generation
    pub fn bind(&mut self, pane: PaneId, channel: ChannelId, generation: Generation) {
        if let Some(pane) = self.pane_mut(pane) {
            pane.binding = Some(Binding {
                channel,
                generation,
            });
        }
    }

    /// Drop every binding, keeping panes intact
    pub fn unbind_all(&mut self) {
        for pane in self.panes_mut() {
            pane.binding = None;
        }
    }

    /// Record the last rendered line for a pane
    pub fn set_marker(&mut self, pane: PaneId, marker: ScrollMarker) {
        if let Some(pane) = self.pane_mut(pane) {
            pane.marker = Some(marker);
        }
    }

    /// Update a pane's geometry
    pub fn resize_pane(&mut self, pane: PaneId, size: TermSize) {
        if let Some(pane) = self.pane_mut(pane) {
            pane.size = size;
        }
    }

    /// Make a pane (and its window) active
    pub fn activate(&mut self, pane: PaneId) {
        if let Some(window) = self.windows.iter().find(|w| w.panes.iter().any(|p| p.id == pane)) {
            self.active_window = Some(window.id);
            self.active_pane = Some(pane);
        }
    }

    /// The active pane, if any
    pub fn active_pane(&self) -> Option<PaneId> {
        self.active_pane
    }

    /// The active window, if any
    pub fn active_window(&self) -> Option<WindowId> {
        self.active_window
    }

    /// Look up a pane
    pub fn pane(&self, pane: PaneId) -> Option<&Pane> {
        self.windows
            .iter()
            .flat_map(|w| w.panes.iter())
            .find(|p| p.id == pane)
    }

    /// Look up a pane mutably
    pub fn pane_mut(&mut self, pane: PaneId) -> Option<&mut Pane> {
        self.windows
            .iter_mut()
            .flat_map(|w| w.panes.iter_mut())
            .find(|p| p.id == pane)
    }

    /// Iterate panes across all windows
    pub fn panes(&self) -> impl Iterator<Item = &Pane> {
        self.windows.iter().flat_map(|w| w.panes.iter())
    }

    /// Iterate panes mutably
    pub fn panes_mut(&mut self) -> impl Iterator<Item = &mut Pane> {
        self.windows.iter_mut().flat_map(|w| w.panes.iter_mut())
    }

    /// Windows in layout order
    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    /// Total pane count
    pub fn pane_count(&self) -> usize {
        self.windows.iter().map(|w| w.panes.len()).sum()
    }

    /// Whether the tree has no panes
    pub fn is_empty(&self) -> bool {
        self.pane_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_tree() {
        let tree = PaneTree::fresh("bash", TermSize::default());
        assert_eq!(tree.pane_count(), 1);
        assert!(tree.active_pane().is_some());
        assert!(tree.panes().next().unwrap().binding.is_none());
    }

    #[test]
    fn test_split_is_structural() {
        let mut tree = PaneTree::fresh("bash", TermSize::new(100, 30));
        let first = tree.active_pane().unwrap();
        tree.bind(first, ChannelId::new(1), Generation(1));

        let second = tree.split_pane(first).unwrap();
        assert_eq!(tree.pane_count(), 2);
        // New pane inherits geometry and command but not the binding
        let pane = tree.pane(second).unwrap();
        assert_eq!(pane.size, TermSize::new(100, 30));
        assert_eq!(pane.command, "bash");
        assert!(pane.binding.is_none());
        // Original binding untouched
        assert!(tree.pane(first).unwrap().binding.is_some());
        assert_eq!(tree.active_pane(), Some(second));
    }

    #[test]
    fn test_close_pane_removes_empty_window() {
        let mut tree = PaneTree::fresh("bash", TermSize::default());
        let pane = tree.active_pane().unwrap();
        tree.close_pane(pane);
        assert!(tree.is_empty());
        assert!(tree.windows().is_empty());
        assert_eq!(tree.active_pane(), None);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut tree = PaneTree::fresh("bash", TermSize::new(80, 24));
        let first = tree.active_pane().unwrap();
        let second = tree.split_pane(first).unwrap();
        tree.resize_pane(second, TermSize::new(120, 40));
        tree.set_marker(first, ScrollMarker::at(77));
        tree.bind(first, ChannelId::new(9), Generation(3));

        let snapshot = tree.snapshot();
        let restored = PaneTree::from_snapshot(&snapshot);

        assert_eq!(restored.pane_count(), 2);
        let panes: Vec<_> = restored.panes().collect();
        assert_eq!(panes[0].marker, Some(ScrollMarker::at(77)));
        assert_eq!(panes[1].size, TermSize::new(120, 40));
        // Bindings never survive a snapshot
        assert!(panes.iter().all(|p| p.binding.is_none()));
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn test_unbind_all_keeps_panes() {
        let mut tree = PaneTree::fresh("bash", TermSize::default());
        let pane = tree.active_pane().unwrap();
        tree.bind(pane, ChannelId::new(2), Generation(1));
        tree.unbind_all();
        assert_eq!(tree.pane_count(), 1);
        assert!(tree.pane(pane).unwrap().binding.is_none());
    }
}
