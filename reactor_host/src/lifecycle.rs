//! Load phase sequencing and the lifecycle event log.
//!
//! Phases advance `pre-init -> default -> after-init`. Re-entering the
//! current phase is allowed (already-loaded plugins are skipped); going back
//! to an earlier phase is refused.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::manifest::{PluginManifest, PluginTiming};

/// Result of asking the phase tracker to enter a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    /// First entry into this phase.
    Entered,
    /// The phase was already entered; loading again is a no-op for loaded
    /// plugins.
    Repeated,
    /// A later phase has already run.
    Backwards { current: PluginTiming },
}

#[derive(Debug, Clone, Default)]
pub struct PhaseTracker {
    current: Option<PluginTiming>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<PluginTiming> {
        self.current
    }

    pub fn enter(&mut self, phase: PluginTiming) -> PhaseTransition {
        match self.current {
            Some(current) if phase < current => PhaseTransition::Backwards { current },
            Some(current) if phase == current => PhaseTransition::Repeated,
            _ => {
                self.current = Some(phase);
                PhaseTransition::Entered
            }
        }
    }
}

/// Manifests belonging to `phase`, in load order: priority descending, then
/// name ascending.
pub fn order_phase(manifests: Vec<PluginManifest>, phase: PluginTiming) -> Vec<PluginManifest> {
    let mut selected: Vec<PluginManifest> = manifests
        .into_iter()
        .filter(|m| m.timing == phase)
        .collect();
    selected.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
    selected
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEventType {
    PhaseStarted,
    PhaseCompleted,
    PluginLoaded,
    PluginFailed,
    PluginStopped,
    PluginStopFailed,
}

/// One entry in the lifecycle log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: Uuid,
    pub event_type: LifecycleEventType,
    pub phase: Option<PluginTiming>,
    pub plugin: Option<String>,
    pub timestamp: SystemTime,
    pub message: String,
}

impl LifecycleEvent {
    pub fn new(event_type: LifecycleEventType, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            phase: None,
            plugin: None,
            timestamp: SystemTime::now(),
            message: message.into(),
        }
    }

    pub fn phase(mut self, phase: PluginTiming) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn plugin(mut self, name: impl Into<String>) -> Self {
        self.plugin = Some(name.into());
        self
    }
}

/// Append-only record of what the plugin manager did.
#[derive(Debug, Clone, Default)]
pub struct LifecycleLog {
    events: Vec<LifecycleEvent>,
}

impl LifecycleLog {
    pub fn record(&mut self, event: LifecycleEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    /// Most recent events first, optionally restricted to one plugin.
    pub fn recent(&self, plugin: Option<&str>, limit: usize) -> Vec<&LifecycleEvent> {
        self.events
            .iter()
            .rev()
            .filter(|e| plugin.map_or(true, |p| e.plugin.as_deref() == Some(p)))
            .take(limit)
            .collect()
    }
}
