use ulid::Ulid;

use crate::model::*;

use super::reconcile::{shift_existing, sync_candidates, SyncReport};
use super::store::{OccurrenceStore, SyncContext, Transaction};
use super::EngineError;

/// What one generator save did, including the sibling fan-out it triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub generator_id: Ulid,
    /// False when this save created the generator.
    pub existed: bool,
    pub shifted: usize,
    pub sync: SyncReport,
    pub siblings: Vec<(Ulid, SyncReport)>,
}

impl SaveReport {
    pub fn created(&self) -> usize {
        self.sync.created + self.siblings.iter().map(|(_, r)| r.created).sum::<usize>()
    }

    pub fn unhooked(&self) -> usize {
        self.sync.unhooked + self.siblings.iter().map(|(_, r)| r.unhooked).sum::<usize>()
    }
}

/// Validate, shift, persist, sync, then (with `cascade`) re-sync every sibling
/// generator of the same event once. Sibling saves run with `cascade = false`,
/// so one call performs at most `1 + siblings` syncs.
pub fn save_generator<S: OccurrenceStore + ?Sized>(
    store: &mut S,
    generator: &Generator,
    cascade: bool,
    ctx: &SyncContext,
) -> Result<SaveReport, EngineError> {
    let generator = &generator.normalized();
    generator.validate()?;

    let previous = store.previous_state(generator.id);
    if let Some(prev) = &previous
        && prev.event_id != generator.event_id
    {
        return Err(EngineError::EventMismatch {
            id: generator.id,
            event_id: generator.event_id,
        });
    }

    // Must run before the new fields are persisted: the shift is relative to them.
    let shifted = match &previous {
        Some(prev) => shift_existing(store, prev, generator)?,
        None => 0,
    };

    store.persist_generator(generator.clone())?;
    let sync = sync_candidates(store, generator, ctx.horizon(generator))?;

    let mut siblings = Vec::new();
    if cascade {
        for sibling in store.list_generators(generator.event_id, Some(generator.id)) {
            let report = save_generator(store, &sibling, false, ctx)?;
            siblings.push((sibling.id, report.sync));
        }
    }

    tracing::debug!(
        generator_id = %generator.id,
        event_id = %generator.event_id,
        shifted,
        created = sync.created,
        retained = sync.retained,
        unhooked = sync.unhooked,
        siblings = siblings.len(),
        "generator saved"
    );

    Ok(SaveReport {
        generator_id: generator.id,
        existed: previous.is_some(),
        shifted,
        sync,
        siblings,
    })
}

/// Re-save every generator of an event in creation order, without cascading
/// (the loop already visits every generator).
pub fn resave_all<S: OccurrenceStore + ?Sized>(
    store: &mut S,
    event_id: Ulid,
    ctx: &SyncContext,
) -> Result<Vec<SaveReport>, EngineError> {
    store
        .list_generators(event_id, None)
        .iter()
        .map(|g| save_generator(store, g, false, ctx))
        .collect()
}

/// Remove a generator. Its occurrences are unhooked and kept.
pub fn delete_generator(txn: &mut Transaction, id: Ulid) -> Result<usize, EngineError> {
    let owned = txn.list_occurrences(id);
    let unhooked = owned.len();
    for mut occurrence in owned {
        occurrence.generated_by = None;
        txn.update_occurrence(occurrence)?;
    }
    txn.remove_generator(id)?;
    Ok(unhooked)
}
