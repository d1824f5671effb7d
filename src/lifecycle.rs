// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-torrent lifecycle state machine.
//!
//! Swarm events are folded into the state and turned into [`Effect`]s that
//! the host executes. The machine itself performs no I/O.

use crate::swarm::SwarmEventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LifecycleState {
    #[default]
    Initiated,
    HashResolved,
    MetadataLoaded,
    Ready,
    Done,
    Destroyed,
    Errored,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Destroyed | LifecycleState::Errored)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Warning(String),
    Error(String),
    InfoHash,
    Metadata,
    Ready,
    Done,
    Destroy,
}

impl From<SwarmEventKind> for LifecycleEvent {
    fn from(kind: SwarmEventKind) -> Self {
        match kind {
            SwarmEventKind::Warning(message) => LifecycleEvent::Warning(message),
            SwarmEventKind::Error(message) => LifecycleEvent::Error(message),
            SwarmEventKind::InfoHash => LifecycleEvent::InfoHash,
            SwarmEventKind::Metadata => LifecycleEvent::Metadata,
            SwarmEventKind::Ready => LifecycleEvent::Ready,
            SwarmEventKind::Done => LifecycleEvent::Done,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SendWarning(String),
    SendError(String),
    SendParsed,
    SendMetadata,
    ApplySelections,
    SendReady,
    StartPendingServer,
    SendDone,
    FetchModtimes,
    RequestProgress,
}

#[derive(Debug, Default)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Lifecycle {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn on_transition(&mut self, event: LifecycleEvent) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let LifecycleEvent::Warning(message) = event {
            effects.push(Effect::SendWarning(message));
            return effects;
        }
        if self.state.is_terminal() {
            return effects;
        }

        match event {
            LifecycleEvent::Warning(_) => {}
            LifecycleEvent::Error(message) => {
                self.state = LifecycleState::Errored;
                effects.push(Effect::SendError(message));
            }
            LifecycleEvent::Destroy => {
                self.state = LifecycleState::Destroyed;
            }
            LifecycleEvent::InfoHash => self.resolve_hash(&mut effects),
            LifecycleEvent::Metadata => self.load_metadata(&mut effects),
            LifecycleEvent::Ready => self.become_ready(&mut effects),
            LifecycleEvent::Done => {
                if self.state < LifecycleState::Done {
                    self.become_ready(&mut effects);
                    self.state = LifecycleState::Done;
                    effects.extend([
                        Effect::SendDone,
                        Effect::RequestProgress,
                        Effect::FetchModtimes,
                    ]);
                }
            }
        }

        effects
    }

    fn resolve_hash(&mut self, effects: &mut Vec<Effect>) {
        if self.state < LifecycleState::HashResolved {
            self.state = LifecycleState::HashResolved;
            effects.push(Effect::SendParsed);
        }
    }

    fn load_metadata(&mut self, effects: &mut Vec<Effect>) {
        if self.state < LifecycleState::MetadataLoaded {
            self.resolve_hash(effects);
            self.state = LifecycleState::MetadataLoaded;
            effects.extend([Effect::SendMetadata, Effect::RequestProgress]);
        }
    }

    fn become_ready(&mut self, effects: &mut Vec<Effect>) {
        if self.state < LifecycleState::Ready {
            self.load_metadata(effects);
            self.state = LifecycleState::Ready;
            effects.extend([
                Effect::ApplySelections,
                Effect::SendReady,
                Effect::RequestProgress,
                Effect::StartPendingServer,
            ]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_lifecycle() {
        let mut lifecycle = Lifecycle::default();
        assert_eq!(
            lifecycle.on_transition(LifecycleEvent::InfoHash),
            vec![Effect::SendParsed]
        );
        assert_eq!(
            lifecycle.on_transition(LifecycleEvent::Metadata),
            vec![Effect::SendMetadata, Effect::RequestProgress]
        );
        assert_eq!(
            lifecycle.on_transition(LifecycleEvent::Ready),
            vec![
                Effect::ApplySelections,
                Effect::SendReady,
                Effect::RequestProgress,
                Effect::StartPendingServer
            ]
        );
        assert_eq!(
            lifecycle.on_transition(LifecycleEvent::Done),
            vec![Effect::SendDone, Effect::RequestProgress, Effect::FetchModtimes]
        );
        assert_eq!(lifecycle.state(), LifecycleState::Done);
    }

    #[test]
    fn test_done_before_ready_still_applies_selections() {
        let mut lifecycle = Lifecycle::default();
        lifecycle.on_transition(LifecycleEvent::InfoHash);
        lifecycle.on_transition(LifecycleEvent::Metadata);

        let effects = lifecycle.on_transition(LifecycleEvent::Done);
        assert_eq!(effects[0], Effect::ApplySelections);
        assert!(effects.contains(&Effect::SendReady));
        assert!(effects.contains(&Effect::SendDone));

        assert!(lifecycle.on_transition(LifecycleEvent::Ready).is_empty());
    }

    #[test]
    fn test_duplicate_events_are_ignored() {
        let mut lifecycle = Lifecycle::default();
        lifecycle.on_transition(LifecycleEvent::InfoHash);
        assert!(lifecycle.on_transition(LifecycleEvent::InfoHash).is_empty());
    }

    #[test]
    fn test_errored_torrent_only_forwards_warnings() {
        let mut lifecycle = Lifecycle::default();
        assert_eq!(
            lifecycle.on_transition(LifecycleEvent::Error("disk full".into())),
            vec![Effect::SendError("disk full".into())]
        );
        assert!(lifecycle.on_transition(LifecycleEvent::Ready).is_empty());
        assert!(lifecycle
            .on_transition(LifecycleEvent::Error("again".into()))
            .is_empty());
        assert_eq!(
            lifecycle.on_transition(LifecycleEvent::Warning("slow".into())),
            vec![Effect::SendWarning("slow".into())]
        );
    }

    #[test]
    fn test_destroyed_drops_lifecycle_events() {
        let mut lifecycle = Lifecycle::default();
        lifecycle.on_transition(LifecycleEvent::Destroy);
        assert!(lifecycle.on_transition(LifecycleEvent::Metadata).is_empty());
        assert_eq!(lifecycle.state(), LifecycleState::Destroyed);
    }
}
