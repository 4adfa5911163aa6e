// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Sync planning.

[plan()] computes the content delta between what a repository holds and what a
remote announces. It performs no I/O.

[SyncRun] tracks the lifecycle of a single sync through [SyncState], rejecting
transitions the lifecycle doesn't allow.
*/

use {
    crate::{
        error::{RepoSyncError, Result},
        package_index::PackageKey,
    },
    std::collections::BTreeSet,
};

/// Content to add to and remove from a repository.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncDelta {
    pub additions: BTreeSet<PackageKey>,
    pub removals: BTreeSet<PackageKey>,
}

impl SyncDelta {
    /// Whether applying the delta would change nothing.
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// Compute the delta that reconciles `current` with `remote`.
///
/// Additions are remote keys not held locally. Removals are only computed in mirror
/// mode, where they are local keys the remote no longer announces.
pub fn plan(
    current: &BTreeSet<PackageKey>,
    remote: &BTreeSet<PackageKey>,
    mirror_mode: bool,
) -> SyncDelta {
    SyncDelta {
        additions: remote.difference(current).cloned().collect(),
        removals: if mirror_mode {
            current.difference(remote).cloned().collect()
        } else {
            BTreeSet::new()
        },
    }
}

/// The lifecycle of a sync.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum::Display)]
pub enum SyncState {
    #[strum(serialize = "fetching-metadata")]
    FetchingMetadata,
    #[strum(serialize = "planning")]
    Planning,
    #[strum(serialize = "downloading")]
    Downloading,
    #[strum(serialize = "finalizing")]
    Finalizing,
    #[strum(serialize = "done")]
    Done,
    #[strum(serialize = "failed")]
    Failed,
}

impl SyncState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn can_transition_to(&self, to: SyncState) -> bool {
        match (self, to) {
            (Self::FetchingMetadata, Self::Planning) => true,
            (Self::Planning, Self::Downloading) => true,
            (Self::Downloading, Self::Finalizing) => true,
            (Self::Finalizing, Self::Done) => true,
            (Self::Done, _) => false,
            (Self::Failed, _) => false,
            (_, Self::Failed) => true,
            _ => false,
        }
    }
}

/// Tracks the state of one sync.
#[derive(Clone, Debug)]
pub struct SyncRun {
    state: SyncState,
    history: Vec<SyncState>,
}

impl Default for SyncRun {
    fn default() -> Self {
        Self {
            state: SyncState::FetchingMetadata,
            history: vec![SyncState::FetchingMetadata],
        }
    }
}

impl SyncRun {
    /// The current state.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Every state this run has been in, in order.
    pub fn history(&self) -> &[SyncState] {
        &self.history
    }

    /// Move to a new state.
    pub fn transition(&mut self, to: SyncState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(RepoSyncError::InvalidStateTransition(self.state, to));
        }

        log::debug!("sync state {} -> {}", self.state, to);
        self.state = to;
        self.history.push(to);

        Ok(())
    }

    /// Move to [SyncState::Failed] unless already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = SyncState::Failed;
            self.history.push(SyncState::Failed);
        }
    }
}
