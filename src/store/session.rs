//! Session state guarded by vector clocks.
//!
//! Writes are optimistic: read state + clock, compute the new state, and only
//! write if the new clock still supersedes whatever is stored at write time.
//! A lost race rebuilds from the newer stored state and joins the clocks with
//! `VectorClock::update`; nothing is ever blindly overwritten.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::{ClockOrdering, VectorClock};
use crate::config::SessionConfig;
use crate::error::StorageError;
use crate::store::traits::{SESSION_PREFIX, StateStore, get_json, put_json};

/// A field both sides changed independently. The local value is kept and the
/// record waits for manual reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub field: String,
    pub local: Value,
    pub remote: Value,
    pub local_node: String,
    pub remote_node: String,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    fn same_values(&self, other: &ConflictRecord) -> bool {
        self.field == other.field && self.local == other.local && self.remote == other.remote
    }
}

/// Per-session state shared between gateway instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub clock: VectorClock,
    /// Every message id this session has seen.
    pub message_ids: BTreeSet<String>,
    pub fields: BTreeMap<String, Value>,
    pub conflicts: Vec<ConflictRecord>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            clock: VectorClock::new(node_id),
            message_ids: BTreeSet::new(),
            fields: BTreeMap::new(),
            conflicts: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Take over a state read from the store (or a peer) as this node's copy.
    pub fn adopt(mut self, node_id: &str) -> Self {
        self.clock = self.clock.adopt(node_id);
        self
    }

    pub fn record_message(&mut self, message_id: impl Into<String>) {
        self.message_ids.insert(message_id.into());
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn needs_reconciliation(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Field-wise merge of a concurrently updated peer state.
    ///
    /// Message ids are unioned, fields only one side has are taken, equal
    /// fields are kept, and differing fields keep the local value with a
    /// `ConflictRecord`. The clock is advanced past both inputs. Returns the
    /// number of new conflicts.
    pub fn merge_concurrent(&mut self, remote: &SessionState) -> usize {
        self.message_ids
            .extend(remote.message_ids.iter().cloned());

        let now = Utc::now();
        let mut new_conflicts = 0;
        for (key, remote_value) in &remote.fields {
            match self.fields.get(key) {
                None => {
                    self.fields.insert(key.clone(), remote_value.clone());
                }
                Some(local_value) if local_value == remote_value => {}
                Some(local_value) => {
                    let record = ConflictRecord {
                        field: key.clone(),
                        local: local_value.clone(),
                        remote: remote_value.clone(),
                        local_node: self.clock.node_id().to_string(),
                        remote_node: remote.clock.node_id().to_string(),
                        detected_at: now,
                    };
                    if !self.conflicts.iter().any(|c| c.same_values(&record)) {
                        self.conflicts.push(record);
                        new_conflicts += 1;
                    }
                }
            }
        }

        for record in &remote.conflicts {
            if !self.conflicts.iter().any(|c| c.same_values(record)) {
                self.conflicts.push(record.clone());
            }
        }

        self.clock.update(&remote.clock);
        self.updated_at = self.updated_at.max(remote.updated_at);
        new_conflicts
    }
}

/// What `SessionStore::receive` did with a peer's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing stored locally; the peer state was stored.
    Created,
    /// The peer state supersedes ours and replaced it.
    Replaced,
    /// Ours supersedes the peer state; nothing written.
    KeptLocal,
    /// Both are identical; nothing written.
    Unchanged,
    /// True conflict; states were merged field-wise.
    Merged { conflicts: usize },
}

/// VectorClock-guarded session persistence on top of a `StateStore`.
pub struct SessionStore {
    store: Arc<dyn StateStore>,
    node_id: String,
    max_attempts: u32,
    ttl: Option<Duration>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn StateStore>, node_id: impl Into<String>, config: &SessionConfig) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            max_attempts: config.max_merge_attempts.max(1),
            ttl: config.state_ttl,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn key(session_id: &str) -> String {
        format!("{SESSION_PREFIX}{session_id}")
    }

    /// Load the stored state for a session.
    pub async fn load(&self, session_id: &str) -> Result<Option<SessionState>, StorageError> {
        get_json(self.store.as_ref(), &Self::key(session_id)).await
    }

    async fn write(&self, state: &SessionState) -> Result<(), StorageError> {
        put_json(
            self.store.as_ref(),
            &Self::key(&state.session_id),
            state,
            self.ttl,
        )
        .await
    }

    /// Apply a local mutation with compare-and-swap semantics.
    ///
    /// `mutate` may run more than once: every lost race rebuilds the state
    /// from the newer stored version and replays it.
    pub async fn apply<F>(&self, session_id: &str, mutate: F) -> Result<SessionState, StorageError>
    where
        F: Fn(&mut SessionState) + Send + Sync,
    {
        let mut lost_clock: Option<VectorClock> = None;

        for attempt in 1..=self.max_attempts {
            let base = self.load(session_id).await?;
            let mut candidate = match base {
                Some(state) => state.adopt(&self.node_id),
                None => SessionState::new(session_id, &self.node_id),
            };

            mutate(&mut candidate);
            match &lost_clock {
                Some(previous) => {
                    candidate.clock.update(previous);
                }
                None => {
                    candidate.clock.tick();
                }
            }
            candidate.updated_at = Utc::now();

            // Re-read right before writing: the stored clock must still be
            // strictly behind ours.
            let current = self.load(session_id).await?;
            let ordering = current
                .as_ref()
                .map(|c| candidate.clock.compare(&c.clock))
                .unwrap_or(ClockOrdering::After);

            if ordering.supersedes() {
                self.write(&candidate).await?;
                debug!(
                    session = %session_id,
                    node = %self.node_id,
                    attempt,
                    "Session state written"
                );
                return Ok(candidate);
            }

            warn!(
                session = %session_id,
                node = %self.node_id,
                attempt,
                ordering = %ordering,
                "Lost session write race, rebuilding from newer state"
            );
            lost_clock = Some(candidate.clock);
        }

        Err(StorageError::ConflictRetriesExhausted {
            key: Self::key(session_id),
            attempts: self.max_attempts,
        })
    }

    /// Reconcile a state received from another instance with ours.
    ///
    /// Writes use the same compare-and-swap as `apply`: the stored clock is
    /// re-read right before writing, and a local write that slipped in since
    /// the first read sends the reconciliation around again.
    pub async fn receive(&self, remote: SessionState) -> Result<MergeOutcome, StorageError> {
        let session_id = remote.session_id.clone();

        for attempt in 1..=self.max_attempts {
            let (outcome, candidate) = match self.load(&session_id).await? {
                None => (MergeOutcome::Created, remote.clone()),
                Some(local) => match remote.clock.compare(&local.clock) {
                    ClockOrdering::After => (MergeOutcome::Replaced, remote.clone()),
                    ClockOrdering::Before => return Ok(received(&remote, MergeOutcome::KeptLocal)),
                    ClockOrdering::Equal => return Ok(received(&remote, MergeOutcome::Unchanged)),
                    ClockOrdering::Concurrent => {
                        let mut merged = local.adopt(&self.node_id);
                        let conflicts = merged.merge_concurrent(&remote);
                        (MergeOutcome::Merged { conflicts }, merged)
                    }
                },
            };

            let current = self.load(&session_id).await?;
            let ordering = current
                .as_ref()
                .map(|c| candidate.clock.compare(&c.clock))
                .unwrap_or(ClockOrdering::After);

            if ordering.supersedes() {
                self.write(&candidate).await?;
                if let MergeOutcome::Merged { conflicts } = outcome
                    && conflicts > 0
                {
                    warn!(
                        session = %session_id,
                        remote_node = %remote.clock.node_id(),
                        conflicts,
                        "Concurrent session update flagged for reconciliation"
                    );
                }
                return Ok(received(&remote, outcome));
            }

            warn!(
                session = %session_id,
                node = %self.node_id,
                attempt,
                ordering = %ordering,
                "Session changed while receiving peer state, reconciling again"
            );
        }

        Err(StorageError::ConflictRetriesExhausted {
            key: Self::key(&session_id),
            attempts: self.max_attempts,
        })
    }
}

fn received(remote: &SessionState, outcome: MergeOutcome) -> MergeOutcome {
    info!(
        session = %remote.session_id,
        remote_node = %remote.clock.node_id(),
        outcome = ?outcome,
        "Peer session state received"
    );
    outcome
}
