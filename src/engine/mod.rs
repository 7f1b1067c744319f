mod error;
mod exclusions;
mod generator;
mod mutations;
mod queries;
mod reconcile;
mod store;

pub use error::{EngineError, ValidationError};
pub use exclusions::{create_exclusion, delete_exclusion};
pub use generator::{delete_generator, resave_all, save_generator, SaveReport};
pub use reconcile::{shift_existing, sync_candidates, SyncReport};
pub use store::{OccurrenceStore, SyncContext, Transaction};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedEventState = Arc<RwLock<EventState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Commit, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            // Flush the batch first, then handle the non-append command
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, commits = batch.len(), "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => {
            flush_and_respond(wal, &mut vec![(commit, response)]);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub state: DashMap<Ulid, SharedEventState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: entity (generator/occurrence/exclusion) id → event id
    pub(super) entity_to_event: DashMap<Ulid, Ulid>,
    /// Shared by event creation and deletion, exclusive for compaction, so the
    /// set of events cannot change under a compaction snapshot.
    pub(super) membership: RwLock<()>,
    pub(super) config: EngineConfig,
}

/// Fold one replayed commit into the event map (no locking, replay owns the map).
fn replay_commit(states: &mut HashMap<Ulid, EventState>, commit: &Commit) {
    for change in &commit.changes {
        match change {
            Change::EventCreated { id, details } => {
                states.insert(*id, EventState::new(*id, details.clone()));
            }
            Change::EventDeleted { id } => {
                states.remove(id);
            }
            other => {
                if let Some(st) = states.get_mut(&commit.event_id) {
                    store::apply_change(st, other);
                }
            }
        }
    }
    if let Some(st) = states.get_mut(&commit.event_id) {
        st.version += 1;
    }
}

fn entity_ids(st: &EventState) -> impl Iterator<Item = Ulid> + '_ {
    st.generators
        .keys()
        .chain(st.occurrences.keys())
        .chain(st.exclusions.keys())
        .copied()
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut states = HashMap::new();
        for commit in &commits {
            replay_commit(&mut states, commit);
        }

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_event: DashMap::new(),
            membership: RwLock::new(()),
            config,
        };
        for (id, st) in states {
            for entity in entity_ids(&st) {
                engine.entity_to_event.insert(entity, id);
            }
            engine.state.insert(id, Arc::new(RwLock::new(st)));
        }
        metrics::gauge!(observability::EVENTS_ACTIVE).set(engine.state.len() as f64);
        tracing::info!(
            path = %wal_path.display(),
            commits = commits.len(),
            events = engine.state.len(),
            "engine loaded"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write a commit to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, commit: &Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit: commit.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub(super) fn sync_context(&self) -> SyncContext {
        SyncContext {
            now: Utc::now(),
            default_generator_limit: self.config.default_generator_limit,
        }
    }

    fn index_change(&self, event_id: Ulid, change: &Change) {
        match change {
            Change::GeneratorSaved(_) | Change::OccurrenceCreated(_) | Change::ExclusionCreated(_) => {
                if let Some(id) = change.entity_id() {
                    self.entity_to_event.insert(id, event_id);
                }
            }
            Change::GeneratorDeleted { id }
            | Change::OccurrenceDeleted { id }
            | Change::ExclusionDeleted { id } => {
                self.entity_to_event.remove(id);
            }
            Change::OccurrenceUpdated(_)
            | Change::EventCreated { .. }
            | Change::EventUpdated { .. }
            | Change::EventDeleted { .. } => {}
        }
    }

    pub(super) fn unindex_event(&self, st: &EventState) {
        for entity in entity_ids(st) {
            self.entity_to_event.remove(&entity);
        }
    }

    /// WAL-append + install + index + notify, if nobody committed on this
    /// event since `base_version` was read. Empty transactions write nothing.
    async fn commit(
        &self,
        shared: &SharedEventState,
        base_version: u64,
        txn: Transaction,
    ) -> Result<Option<Commit>, EngineError> {
        let (mut next, changes) = txn.into_parts();
        if changes.is_empty() {
            return Ok(None);
        }

        let mut guard = shared.write().await;
        if guard.version != base_version {
            return Err(EngineError::Conflict(guard.id));
        }
        let commit = Commit {
            event_id: guard.id,
            changes,
        };
        self.wal_append(&commit).await?;

        next.version = base_version + 1;
        *guard = next;
        for change in &commit.changes {
            self.index_change(commit.event_id, change);
        }
        drop(guard);

        self.notify.send(commit.event_id, &commit);
        Ok(Some(commit))
    }

    /// Run `f` against a working copy of one event and commit the result atomically.
    ///
    /// `f` may run several times: a commit that loses to a concurrent one is
    /// retried from a fresh snapshot, up to `max_save_retries` extra attempts.
    /// Any error from `f` discards its working copy.
    pub(super) async fn transact<T, F>(
        &self,
        op: &'static str,
        event_id: Ulid,
        mut f: F,
    ) -> Result<(T, Option<Commit>), EngineError>
    where
        F: FnMut(&mut Transaction) -> Result<T, EngineError> + Send,
        T: Send,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        let result = loop {
            let Some(shared) = self.event_state(&event_id) else {
                break Err(EngineError::NotFound(event_id));
            };
            let (snapshot, base_version) = {
                let guard = shared.read().await;
                (guard.clone(), guard.version)
            };

            let mut txn = Transaction::new(snapshot, self.sync_context());
            let value = match f(&mut txn) {
                Ok(v) => v,
                Err(e) => break Err(e),
            };

            match self.commit(&shared, base_version, txn).await {
                Ok(commit) => break Ok((value, commit)),
                Err(e) if e.is_retryable() && attempt < self.config.max_save_retries => {
                    attempt += 1;
                    metrics::counter!(observability::COMMIT_CONFLICTS_TOTAL).increment(1);
                    tracing::warn!(%event_id, op, attempt, "commit conflict, retrying");
                }
                Err(e) => break Err(e),
            }
        };

        observability::record_operation(op, result.is_ok(), started.elapsed());
        if let Err(e) = &result {
            tracing::debug!(%event_id, op, error = %e, "operation failed");
        }
        result
    }

    /// Event owning a generator, occurrence or exclusion.
    pub(super) fn owning_event(&self, entity_id: &Ulid) -> Result<Ulid, EngineError> {
        self.event_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))
    }
}
