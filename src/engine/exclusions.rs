use ulid::Ulid;

use crate::model::*;

use super::generator::{resave_all, SaveReport};
use super::store::{OccurrenceStore, SyncContext, Transaction};
use super::EngineError;

/// Record an exclusion and unhook every generated occurrence already sitting at
/// that start. Returns the number unhooked. Manual occurrences are untouched.
pub fn create_exclusion(txn: &mut Transaction, exclusion: Exclusion) -> Result<usize, EngineError> {
    let start = exclusion.start;
    txn.insert_exclusion(exclusion)?;

    let owned: Vec<Occurrence> = txn
        .state()
        .occurrences_at(start)
        .filter(|o| o.generated_by.is_some())
        .cloned()
        .collect();
    let unhooked = owned.len();
    for mut occurrence in owned {
        tracing::trace!(occurrence_id = %occurrence.id, %start, "unhooking excluded occurrence");
        occurrence.generated_by = None;
        txn.update_occurrence(occurrence)?;
    }
    Ok(unhooked)
}

/// Drop an exclusion, then re-save every generator of the event so the freed
/// slot can be generated again.
pub fn delete_exclusion(
    txn: &mut Transaction,
    id: Ulid,
    ctx: &SyncContext,
) -> Result<Vec<SaveReport>, EngineError> {
    let removed = txn.remove_exclusion(id)?;
    resave_all(txn, removed.event_id, ctx)
}
