use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{
    exclusions, generator, Engine, EngineError, OccurrenceStore, SaveReport, SharedEventState,
    ValidationError, WalCommand,
};

fn validate_details(details: &EventDetails) -> Result<(), EngineError> {
    if details.title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("event title too long"));
    }
    if details
        .description
        .as_ref()
        .is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN)
    {
        return Err(EngineError::LimitExceeded("event description too long"));
    }
    Ok(())
}

fn checked_span(start: Ts, end: Ts) -> Result<Span, EngineError> {
    if start > end {
        return Err(ValidationError::StartAfterEnd { start, end }.into());
    }
    Ok(Span::new(start, end))
}

impl Engine {
    // ── Events ───────────────────────────────────────────────

    pub async fn create_event(&self, id: Ulid, details: EventDetails) -> Result<(), EngineError> {
        validate_details(&details)?;
        let _membership = self.membership.read().await;
        if self.state.len() >= MAX_EVENTS {
            return Err(EngineError::LimitExceeded("too many events"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let commit = Commit {
            event_id: id,
            changes: vec![Change::EventCreated { id, details: details.clone() }],
        };
        self.wal_append(&commit).await?;
        let mut st = EventState::new(id, details);
        st.version = 1;
        self.state.insert(id, Arc::new(RwLock::new(st)));
        metrics::gauge!(observability::EVENTS_ACTIVE).set(self.state.len() as f64);
        self.notify.send(id, &commit);
        tracing::info!(event_id = %id, "event created");
        Ok(())
    }

    pub async fn update_event(&self, id: Ulid, details: EventDetails) -> Result<(), EngineError> {
        validate_details(&details)?;
        self.transact("update_event", id, |txn| {
            txn.update_details(details.clone());
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Re-save every generator of the event (no cascade), e.g. after the
    /// default horizon has moved on.
    pub async fn resave_event(&self, id: Ulid) -> Result<Vec<SaveReport>, EngineError> {
        let (reports, _) = self
            .transact("resave_event", id, |txn| {
                let ctx = txn.ctx();
                generator::resave_all(txn, id, &ctx)
            })
            .await?;
        reports.iter().for_each(observability::record_save);
        Ok(reports)
    }

    /// Refused while the event still has occurrences: they may carry user edits.
    pub async fn delete_event(&self, id: Ulid) -> Result<(), EngineError> {
        let _membership = self.membership.read().await;
        let shared = self.event_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = shared.write().await;
        if !self.state.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if !guard.occurrences.is_empty() {
            return Err(EngineError::HasOccurrences(id));
        }

        let commit = Commit {
            event_id: id,
            changes: vec![Change::EventDeleted { id }],
        };
        self.wal_append(&commit).await?;
        // Any transaction still holding a snapshot must fail its version check.
        guard.version += 1;
        self.unindex_event(&guard);
        self.state.remove(&id);
        drop(guard);

        metrics::gauge!(observability::EVENTS_ACTIVE).set(self.state.len() as f64);
        self.notify.send(id, &commit);
        self.notify.remove(&id);
        tracing::info!(event_id = %id, "event deleted");
        Ok(())
    }

    // ── Generators ───────────────────────────────────────────

    /// Create or update a generator and reconcile its occurrences. With
    /// `cascade`, every sibling generator is re-synced afterwards so slots freed
    /// by this save can be claimed. All of it commits or none of it does.
    pub async fn save_generator(
        &self,
        generator: Generator,
        cascade: bool,
    ) -> Result<SaveReport, EngineError> {
        if let Some(owner) = self.event_for_entity(&generator.id)
            && owner != generator.event_id
        {
            return Err(EngineError::EventMismatch {
                id: generator.id,
                event_id: generator.event_id,
            });
        }

        let (report, _) = self
            .transact("save_generator", generator.event_id, |txn| {
                let ctx = txn.ctx();
                generator::save_generator(txn, &generator, cascade, &ctx)
            })
            .await?;

        observability::record_save(&report);
        tracing::info!(
            generator_id = %report.generator_id,
            event_id = %generator.event_id,
            existed = report.existed,
            shifted = report.shifted,
            created = report.created(),
            unhooked = report.unhooked(),
            cascaded = report.siblings.len(),
            "generator saved"
        );
        Ok(report)
    }

    /// Remove a generator; its occurrences are unhooked, never deleted.
    /// Returns how many were unhooked.
    pub async fn delete_generator(&self, id: Ulid) -> Result<usize, EngineError> {
        let event_id = self.owning_event(&id)?;
        let (unhooked, _) = self
            .transact("delete_generator", event_id, |txn| generator::delete_generator(txn, id))
            .await?;
        metrics::counter!(observability::OCCURRENCES_UNHOOKED_TOTAL).increment(unhooked as u64);
        tracing::info!(generator_id = %id, %event_id, unhooked, "generator deleted");
        Ok(unhooked)
    }

    // ── Occurrences ──────────────────────────────────────────

    pub async fn create_manual_occurrence(
        &self,
        id: Ulid,
        event_id: Ulid,
        start: Ts,
        end: Ts,
    ) -> Result<Occurrence, EngineError> {
        let span = checked_span(start, end)?;
        if self.event_for_entity(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let (occurrence, _) = self
            .transact("create_manual_occurrence", event_id, |txn| {
                txn.create_manual_occurrence(id, span)
            })
            .await?;
        Ok(occurrence)
    }

    /// Load, edit and persist one occurrence.
    async fn edit_occurrence(
        &self,
        op: &'static str,
        id: Ulid,
        edit: impl Fn(&mut Occurrence) + Send + Sync,
    ) -> Result<Occurrence, EngineError> {
        let event_id = self.owning_event(&id)?;
        let (occurrence, _) = self
            .transact(op, event_id, |txn| {
                let mut occurrence = txn.occurrence(id)?.clone();
                edit(&mut occurrence);
                txn.update_occurrence(occurrence.clone())?;
                Ok(occurrence)
            })
            .await?;
        Ok(occurrence)
    }

    pub async fn cancel_occurrence(&self, id: Ulid) -> Result<Occurrence, EngineError> {
        self.edit_occurrence("cancel_occurrence", id, |o| o.cancelled = true).await
    }

    pub async fn uncancel_occurrence(&self, id: Ulid) -> Result<Occurrence, EngineError> {
        self.edit_occurrence("uncancel_occurrence", id, |o| o.cancelled = false).await
    }

    pub async fn set_occurrence_full(&self, id: Ulid, full: bool) -> Result<Occurrence, EngineError> {
        self.edit_occurrence("set_occurrence_full", id, |o| o.full = full).await
    }

    pub async fn set_occurrence_hidden(&self, id: Ulid, hidden: bool) -> Result<Occurrence, EngineError> {
        self.edit_occurrence("set_occurrence_hidden", id, |o| o.hide_from_lists = hidden)
            .await
    }

    /// Move one occurrence. Only the varied span changes, so the generator
    /// keeps recognising it by its unvaried start.
    pub async fn vary_occurrence_time(
        &self,
        id: Ulid,
        start: Ts,
        end: Ts,
    ) -> Result<Occurrence, EngineError> {
        let span = checked_span(start, end)?;
        self.edit_occurrence("vary_occurrence_time", id, |o| o.varied = span).await
    }

    /// Replace (or with `None`, clear) the details shown for one occurrence.
    pub async fn vary_occurrence_content(
        &self,
        id: Ulid,
        variation: Option<VariationRecord>,
    ) -> Result<Occurrence, EngineError> {
        if let Some(v) = &variation {
            validate_details(&v.details)?;
        }
        self.edit_occurrence("vary_occurrence_content", id, |o| {
            o.content_override = variation.clone()
        })
        .await
    }

    /// Explicit removal. A generated slot freed this way is regenerated on the
    /// next save of its generator unless an exclusion covers it.
    pub async fn delete_occurrence(&self, id: Ulid) -> Result<Occurrence, EngineError> {
        let event_id = self.owning_event(&id)?;
        let (removed, _) = self
            .transact("delete_occurrence", event_id, |txn| txn.delete_occurrence(id))
            .await?;
        Ok(removed)
    }

    // ── Exclusions ───────────────────────────────────────────

    /// Exclude a start from generation. Generated occurrences already at that
    /// start are unhooked and kept. Returns how many were unhooked.
    pub async fn create_exclusion(&self, id: Ulid, event_id: Ulid, start: Ts) -> Result<usize, EngineError> {
        if self.event_for_entity(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let exclusion = Exclusion { id, event_id, start };
        let (unhooked, _) = self
            .transact("create_exclusion", event_id, |txn| {
                exclusions::create_exclusion(txn, exclusion.clone())
            })
            .await?;
        metrics::counter!(observability::OCCURRENCES_UNHOOKED_TOTAL).increment(unhooked as u64);
        tracing::info!(exclusion_id = %id, %event_id, %start, unhooked, "exclusion created");
        Ok(unhooked)
    }

    /// Lift an exclusion and re-save every generator of its event.
    pub async fn delete_exclusion(&self, id: Ulid) -> Result<Vec<SaveReport>, EngineError> {
        let event_id = self.owning_event(&id)?;
        let (reports, _) = self
            .transact("delete_exclusion", event_id, |txn| {
                let ctx = txn.ctx();
                exclusions::delete_exclusion(txn, id, &ctx)
            })
            .await?;
        reports.iter().for_each(observability::record_save);
        tracing::info!(exclusion_id = %id, %event_id, resaved = reports.len(), "exclusion deleted");
        Ok(reports)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as one snapshot commit per event.
    ///
    /// Every event's read lock is held until the new file is in place. A commit
    /// appends to the WAL only under its event's write lock, so nothing can land
    /// in the old file after its event was snapshotted.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _membership = self.membership.write().await;
        let shared: Vec<SharedEventState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(shared.len());
        for rs in shared {
            guards.push(rs.read_owned().await);
        }

        let commits: Vec<Commit> = guards
            .iter()
            .map(|guard| {
                let mut changes = vec![Change::EventCreated {
                    id: guard.id,
                    details: guard.details.clone(),
                }];
                changes.extend(guard.generators.values().cloned().map(Change::GeneratorSaved));
                changes.extend(guard.occurrences.values().cloned().map(Change::OccurrenceCreated));
                changes.extend(guard.exclusions.values().cloned().map(Change::ExclusionCreated));
                Commit {
                    event_id: guard.id,
                    changes,
                }
            })
            .collect();
        let events = commits.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { commits, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        drop(guards);
        tracing::info!(events, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))
    }

    /// Compact once the WAL has grown past `threshold` appends. Returns whether it did.
    pub async fn compact_if_needed(&self, threshold: u64) -> Result<bool, EngineError> {
        let appends = self.wal_appends_since_compact().await?;
        if appends < threshold {
            return Ok(false);
        }
        tracing::info!(appends, threshold, "WAL over threshold, compacting");
        self.compact_wal().await?;
        Ok(true)
    }
}
