use chrono::TimeDelta;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::rule;

use super::EngineError;

/// The storage contract the reconciliation core runs against.
///
/// Reads see every write made earlier through the same store. Nothing here
/// deletes an occurrence.
pub trait OccurrenceStore {
    /// Occurrence of `event_id` whose unvaried start is `start`, whichever
    /// generator (if any) owns it. Lowest id wins when several share a start.
    fn find_occurrence(&self, event_id: Ulid, start: Ts) -> Option<Occurrence>;

    /// Occurrences currently owned by a generator.
    fn list_occurrences(&self, generator_id: Ulid) -> Vec<Occurrence>;

    fn create_occurrence(
        &mut self,
        generator_id: Ulid,
        event_id: Ulid,
        span: Span,
    ) -> Result<Occurrence, EngineError>;

    fn update_occurrence(&mut self, occurrence: Occurrence) -> Result<(), EngineError>;

    fn is_excluded(&self, event_id: Ulid, start: Ts) -> bool;

    /// Generators of `event_id` in ascending id order, optionally skipping one.
    fn list_generators(&self, event_id: Ulid, excluding: Option<Ulid>) -> Vec<Generator>;

    /// The generator as last persisted, before the in-flight update.
    fn previous_state(&self, generator_id: Ulid) -> Option<Generator>;

    fn persist_generator(&mut self, generator: Generator) -> Result<(), EngineError>;
}

/// Clock and horizon settings shared by every save in one transaction.
#[derive(Debug, Clone, Copy)]
pub struct SyncContext {
    pub now: Ts,
    pub default_generator_limit: TimeDelta,
}

impl SyncContext {
    pub fn horizon(&self, generator: &Generator) -> Ts {
        rule::horizon(generator.repeat_until, self.now, self.default_generator_limit)
    }
}

/// Apply a change to an event's state (no locking, caller owns the state).
pub(crate) fn apply_change(st: &mut EventState, change: &Change) {
    match change {
        Change::EventUpdated { details, .. } => st.details = details.clone(),
        Change::GeneratorSaved(g) => {
            st.generators.insert(g.id, g.clone());
        }
        Change::GeneratorDeleted { id } => {
            st.generators.remove(id);
        }
        Change::OccurrenceCreated(o) | Change::OccurrenceUpdated(o) => st.upsert_occurrence(o.clone()),
        Change::OccurrenceDeleted { id } => {
            st.remove_occurrence(*id);
        }
        Change::ExclusionCreated(x) => {
            st.exclusions.insert(x.id, x.clone());
        }
        Change::ExclusionDeleted { id } => {
            st.exclusions.remove(id);
        }
        // Created/Deleted are handled at the event map level, not here
        Change::EventCreated { .. } | Change::EventDeleted { .. } => {}
    }
}

/// A working copy of one event's state plus the changes made to it.
///
/// Dropping a transaction discards everything; only the engine's commit makes
/// the changes visible.
pub struct Transaction {
    state: EventState,
    changes: Vec<Change>,
    ctx: SyncContext,
}

impl Transaction {
    pub fn new(state: EventState, ctx: SyncContext) -> Self {
        Self {
            state,
            changes: Vec::new(),
            ctx,
        }
    }

    pub fn state(&self) -> &EventState {
        &self.state
    }

    pub fn ctx(&self) -> SyncContext {
        self.ctx
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn into_parts(self) -> (EventState, Vec<Change>) {
        (self.state, self.changes)
    }

    fn record(&mut self, change: Change) {
        apply_change(&mut self.state, &change);
        self.changes.push(change);
    }

    fn ensure_event(&self, event_id: Ulid) -> Result<(), EngineError> {
        if event_id == self.state.id {
            Ok(())
        } else {
            Err(EngineError::NotFound(event_id))
        }
    }

    /// Strictly greater than every occurrence id already in this event, so id
    /// order matches creation order for generated occurrences.
    fn next_occurrence_id(&self) -> Ulid {
        let fresh = Ulid::new();
        match self.state.occurrences.keys().next_back() {
            Some(last) if *last >= fresh => last.increment().unwrap_or(fresh),
            _ => fresh,
        }
    }

    fn check_occurrence_capacity(&self) -> Result<(), EngineError> {
        if self.state.occurrences.len() >= MAX_OCCURRENCES_PER_EVENT {
            return Err(EngineError::LimitExceeded("too many occurrences on event"));
        }
        Ok(())
    }

    pub fn occurrence(&self, id: Ulid) -> Result<&Occurrence, EngineError> {
        self.state.occurrences.get(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn update_details(&mut self, details: EventDetails) {
        if self.state.details != details {
            let id = self.state.id;
            self.record(Change::EventUpdated { id, details });
        }
    }

    pub fn create_manual_occurrence(&mut self, id: Ulid, span: Span) -> Result<Occurrence, EngineError> {
        if self.state.occurrences.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.check_occurrence_capacity()?;
        let occurrence = Occurrence::new(id, self.state.id, None, span);
        self.record(Change::OccurrenceCreated(occurrence.clone()));
        Ok(occurrence)
    }

    /// Explicit removal by a caller. Reconciliation never calls this.
    pub fn delete_occurrence(&mut self, id: Ulid) -> Result<Occurrence, EngineError> {
        let removed = self.occurrence(id)?.clone();
        self.record(Change::OccurrenceDeleted { id });
        Ok(removed)
    }

    pub fn insert_exclusion(&mut self, exclusion: Exclusion) -> Result<(), EngineError> {
        self.ensure_event(exclusion.event_id)?;
        if self.state.exclusions.contains_key(&exclusion.id) {
            return Err(EngineError::AlreadyExists(exclusion.id));
        }
        if let Some(existing) = self.state.exclusion_at(exclusion.start) {
            return Err(EngineError::AlreadyExists(existing.id));
        }
        if self.state.exclusions.len() >= MAX_EXCLUSIONS_PER_EVENT {
            return Err(EngineError::LimitExceeded("too many exclusions on event"));
        }
        self.record(Change::ExclusionCreated(exclusion));
        Ok(())
    }

    pub fn remove_exclusion(&mut self, id: Ulid) -> Result<Exclusion, EngineError> {
        let removed = self
            .state
            .exclusions
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        self.record(Change::ExclusionDeleted { id });
        Ok(removed)
    }

    pub fn remove_generator(&mut self, id: Ulid) -> Result<Generator, EngineError> {
        let removed = self
            .state
            .generators
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        self.record(Change::GeneratorDeleted { id });
        Ok(removed)
    }
}

impl OccurrenceStore for Transaction {
    fn find_occurrence(&self, event_id: Ulid, start: Ts) -> Option<Occurrence> {
        if event_id != self.state.id {
            return None;
        }
        self.state.occurrences_at(start).next().cloned()
    }

    fn list_occurrences(&self, generator_id: Ulid) -> Vec<Occurrence> {
        self.state.occurrences_of(generator_id).cloned().collect()
    }

    fn create_occurrence(
        &mut self,
        generator_id: Ulid,
        event_id: Ulid,
        span: Span,
    ) -> Result<Occurrence, EngineError> {
        self.ensure_event(event_id)?;
        if let Some(dup) = self
            .state
            .occurrences_at(span.start)
            .find(|o| o.generated_by == Some(generator_id) && o.unvaried == span)
        {
            return Err(EngineError::AlreadyExists(dup.id));
        }
        self.check_occurrence_capacity()?;
        let occurrence = Occurrence::new(self.next_occurrence_id(), event_id, Some(generator_id), span);
        self.record(Change::OccurrenceCreated(occurrence.clone()));
        Ok(occurrence)
    }

    fn update_occurrence(&mut self, occurrence: Occurrence) -> Result<(), EngineError> {
        self.ensure_event(occurrence.event_id)?;
        let current = self.occurrence(occurrence.id)?;
        if *current == occurrence {
            return Ok(());
        }
        self.record(Change::OccurrenceUpdated(occurrence));
        Ok(())
    }

    fn is_excluded(&self, event_id: Ulid, start: Ts) -> bool {
        event_id == self.state.id && self.state.exclusion_at(start).is_some()
    }

    fn list_generators(&self, event_id: Ulid, excluding: Option<Ulid>) -> Vec<Generator> {
        if event_id != self.state.id {
            return Vec::new();
        }
        self.state
            .generators
            .values()
            .filter(|g| Some(g.id) != excluding)
            .cloned()
            .collect()
    }

    fn previous_state(&self, generator_id: Ulid) -> Option<Generator> {
        self.state.generators.get(&generator_id).cloned()
    }

    fn persist_generator(&mut self, generator: Generator) -> Result<(), EngineError> {
        self.ensure_event(generator.event_id)?;
        match self.state.generators.get(&generator.id) {
            Some(current) if *current == generator => return Ok(()),
            Some(_) => {}
            None if self.state.generators.len() >= MAX_GENERATORS_PER_EVENT => {
                return Err(EngineError::LimitExceeded("too many generators on event"));
            }
            None => {}
        }
        self.record(Change::GeneratorSaved(generator));
        Ok(())
    }
}
