use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedEventState};

impl Engine {
    pub fn event_state(&self, id: &Ulid) -> Option<SharedEventState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn event_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_event.get(entity_id).map(|e| *e.value())
    }

    /// Read-locked view of one event, mapped through `f`.
    async fn read_event<T>(&self, id: Ulid, f: impl FnOnce(&EventState) -> T + Send) -> Result<T, EngineError> {
        let rs = self.event_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(f(&*guard))
    }

    /// Like `read_event`, for the event owning `entity_id`.
    async fn read_owner<T>(
        &self,
        entity_id: Ulid,
        f: impl FnOnce(&EventState) -> Option<T> + Send,
    ) -> Result<T, EngineError> {
        let event_id = self.owning_event(&entity_id)?;
        self.read_event(event_id, f)
            .await?
            .ok_or(EngineError::NotFound(entity_id))
    }

    // ── Events ───────────────────────────────────────────────

    pub async fn get_event(&self, id: Ulid) -> Result<EventDetails, EngineError> {
        self.read_event(id, |st| st.details.clone()).await
    }

    /// Full copy of an event's state.
    pub async fn snapshot_event(&self, id: Ulid) -> Result<EventState, EngineError> {
        self.read_event(id, EventState::clone).await
    }

    /// All events in id order.
    pub async fn list_events(&self) -> Vec<(Ulid, EventDetails)> {
        let shared: Vec<SharedEventState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for rs in shared {
            let guard = rs.read().await;
            out.push((guard.id, guard.details.clone()));
        }
        out.sort_by_key(|(id, _)| *id);
        out
    }

    // ── Generators ───────────────────────────────────────────

    pub async fn get_generator(&self, id: Ulid) -> Result<Generator, EngineError> {
        self.read_owner(id, |st| st.generators.get(&id).cloned()).await
    }

    /// Generators of an event in creation order.
    pub async fn list_generators(&self, event_id: Ulid) -> Result<Vec<Generator>, EngineError> {
        self.read_event(event_id, |st| st.generators.values().cloned().collect())
            .await
    }

    pub async fn generator_spans(&self, id: Ulid) -> Result<GeneratorSpans, EngineError> {
        self.read_owner(id, |st| {
            let generator = st.generators.get(&id)?;
            let owned: Vec<Occurrence> = st.occurrences_of(id).cloned().collect();
            Some(generator.spans(&owned))
        })
        .await
    }

    // ── Occurrences ──────────────────────────────────────────

    pub async fn get_occurrence(&self, id: Ulid) -> Result<Occurrence, EngineError> {
        self.read_owner(id, |st| st.occurrences.get(&id).cloned()).await
    }

    /// Every occurrence of an event in schedule order, hidden ones included.
    pub async fn list_occurrences(&self, event_id: Ulid) -> Result<Vec<Occurrence>, EngineError> {
        self.read_event(event_id, |st| {
            let mut all: Vec<Occurrence> = st.occurrences.values().cloned().collect();
            all.sort_by_key(Occurrence::sort_key);
            all
        })
        .await
    }

    /// Occurrences whose actual (varied) span intersects `[from, to)`.
    pub async fn occurrences_between(
        &self,
        event_id: Ulid,
        from: Ts,
        to: Ts,
    ) -> Result<Vec<Occurrence>, EngineError> {
        self.read_event(event_id, |st| {
            st.occurrences_between(from, to).into_iter().cloned().collect()
        })
        .await
    }

    /// Occurrences a generator currently owns, in schedule order.
    pub async fn generator_occurrences(&self, generator_id: Ulid) -> Result<Vec<Occurrence>, EngineError> {
        self.read_owner(generator_id, |st| {
            st.generators.get(&generator_id)?;
            let mut owned: Vec<Occurrence> = st.occurrences_of(generator_id).cloned().collect();
            owned.sort_by_key(Occurrence::sort_key);
            Some(owned)
        })
        .await
    }

    /// The persisted occurrence for a generated slot, if one exists. Callers
    /// rendering a schedule use it to prefer the stored (possibly varied)
    /// occurrence over a freshly computed one.
    pub async fn find_exception(
        &self,
        generator_id: Ulid,
        unvaried: Span,
    ) -> Result<Option<Occurrence>, EngineError> {
        self.read_owner(generator_id, |st| {
            st.generators.get(&generator_id)?;
            Some(
                st.occurrences_at(unvaried.start)
                    .find(|o| o.generated_by == Some(generator_id) && o.unvaried == unvaried)
                    .cloned(),
            )
        })
        .await
    }

    // ── Exclusions ───────────────────────────────────────────

    /// Exclusions of an event by start.
    pub async fn list_exclusions(&self, event_id: Ulid) -> Result<Vec<Exclusion>, EngineError> {
        self.read_event(event_id, |st| {
            let mut all: Vec<Exclusion> = st.exclusions.values().cloned().collect();
            all.sort_by_key(|x| x.start);
            all
        })
        .await
    }

    // ── Notifications ────────────────────────────────────────

    /// Receive every commit made on an event from now on.
    pub fn subscribe(&self, event_id: Ulid) -> Result<broadcast::Receiver<Commit>, EngineError> {
        if !self.state.contains_key(&event_id) {
            return Err(EngineError::NotFound(event_id));
        }
        Ok(self.notify.subscribe(event_id))
    }
}
