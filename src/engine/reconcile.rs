use std::collections::BTreeMap;

use ulid::Ulid;

use crate::model::*;
use crate::rule;

use super::store::OccurrenceStore;
use super::EngineError;

/// Outcome of one candidate sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub candidates: usize,
    pub created: usize,
    pub retained: usize,
    pub unhooked: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.unhooked == 0
    }
}

/// Pass 1: move every occurrence of an updated generator along with its schedule.
///
/// Start moves by the change in `event_start`; the end is recomputed from the
/// new duration. Flags and content overrides are left alone. Nothing is added
/// or removed here. Returns the number of occurrences rewritten.
pub fn shift_existing<S: OccurrenceStore + ?Sized>(
    store: &mut S,
    previous: &Generator,
    new: &Generator,
) -> Result<usize, EngineError> {
    let start_shift = new.event_start - previous.event_start;
    let end_shift = new.event_end - previous.event_end;
    if start_shift.is_zero() && end_shift.is_zero() {
        return Ok(0);
    }

    let duration = new.duration();
    let mut shifted = 0;
    for mut occurrence in store.list_occurrences(new.id) {
        let varied_start = occurrence.varied.start + start_shift;
        occurrence.varied = Span::new(varied_start, varied_start + duration);
        let unvaried_start = occurrence.unvaried.start + start_shift;
        occurrence.unvaried = Span::new(unvaried_start, unvaried_start + duration);
        store.update_occurrence(occurrence)?;
        shifted += 1;
    }
    tracing::debug!(
        generator_id = %new.id,
        shift_secs = start_shift.num_seconds(),
        shifted,
        "shifted existing occurrences"
    );
    Ok(shifted)
}

/// Pass 2: make the generator's occurrences match its candidate starts.
///
/// - candidate already materialized by this generator: kept (unless excluded)
/// - candidate occupied by another generator or a manual occurrence: left alone
/// - free, non-excluded candidate: new occurrence
/// - owned occurrence that no candidate accounts for: unhooked, never deleted
pub fn sync_candidates<S: OccurrenceStore + ?Sized>(
    store: &mut S,
    generator: &Generator,
    horizon: Ts,
) -> Result<SyncReport, EngineError> {
    let candidates = rule::expand(generator.rule.as_ref(), generator.event_start, horizon)?;
    let duration = generator.duration();
    let event_id = generator.event_id;

    let mut unaccounted: BTreeMap<Ulid, Occurrence> = store
        .list_occurrences(generator.id)
        .into_iter()
        .map(|o| (o.id, o))
        .collect();
    let mut report = SyncReport {
        candidates: candidates.len(),
        ..SyncReport::default()
    };

    for start in candidates {
        if let Some(existing) = store.find_occurrence(event_id, start) {
            if existing.generated_by == Some(generator.id) {
                if store.is_excluded(event_id, start) {
                    tracing::trace!(%start, occurrence_id = %existing.id, "owned occurrence is excluded");
                } else {
                    unaccounted.remove(&existing.id);
                    report.retained += 1;
                }
            }
            continue;
        }

        if store.is_excluded(event_id, start) {
            tracing::trace!(%start, "candidate excluded");
            continue;
        }

        store.create_occurrence(generator.id, event_id, Span::new(start, start + duration))?;
        report.created += 1;
    }

    for (_, mut orphan) in unaccounted {
        tracing::trace!(occurrence_id = %orphan.id, start = %orphan.unvaried.start, "unhooking");
        orphan.generated_by = None;
        store.update_occurrence(orphan)?;
        report.unhooked += 1;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::{SyncContext, Transaction};
    use chrono::{TimeDelta, TimeZone, Utc};

    fn at(d: u32, h: u32) -> Ts {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    fn setup() -> (Transaction, Generator) {
        let state = EventState::new(Ulid::new(), EventDetails::titled("Choir"));
        let g = Generator::new(
            Ulid::new(),
            state.id,
            GeneratorFields {
                event_start: at(1, 10),
                event_end: Some(at(1, 11)),
                rule: Some(crate::rule::Rule::parse("FREQ=WEEKLY").unwrap()),
                repeat_until: Some(at(22, 23)),
            },
        );
        let mut txn = Transaction::new(
            state,
            SyncContext { now: at(1, 0), default_generator_limit: TimeDelta::days(30) },
        );
        txn.persist_generator(g.clone()).unwrap();
        (txn, g)
    }

    fn owned_starts(txn: &Transaction, g: &Generator) -> Vec<Ts> {
        let mut starts: Vec<Ts> = txn.list_occurrences(g.id).iter().map(|o| o.varied.start).collect();
        starts.sort();
        starts
    }

    #[test]
    fn sync_materializes_every_candidate() {
        let (mut txn, g) = setup();
        let report = sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        assert_eq!(report, SyncReport { candidates: 4, created: 4, retained: 0, unhooked: 0 });
        assert_eq!(owned_starts(&txn, &g), vec![at(1, 10), at(8, 10), at(15, 10), at(22, 10)]);
        for o in txn.list_occurrences(g.id) {
            assert_eq!(o.varied, o.unvaried);
            assert_eq!(o.varied.duration(), TimeDelta::hours(1));
        }
    }

    #[test]
    fn sync_is_idempotent() {
        let (mut txn, g) = setup();
        sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        let before = txn.state().clone();
        let changes = txn.changes().len();

        let report = sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        assert!(report.is_noop());
        assert_eq!(report.retained, 4);
        assert_eq!(txn.changes().len(), changes);
        assert_eq!(*txn.state(), before);
    }

    #[test]
    fn excluded_candidates_are_not_materialized() {
        let (mut txn, g) = setup();
        txn.insert_exclusion(Exclusion { id: Ulid::new(), event_id: g.event_id, start: at(8, 10) })
            .unwrap();
        let report = sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        assert_eq!(report.created, 3);
        assert_eq!(owned_starts(&txn, &g), vec![at(1, 10), at(15, 10), at(22, 10)]);
    }

    #[test]
    fn owned_but_excluded_occurrence_is_unhooked() {
        let (mut txn, g) = setup();
        sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        // Exclusion recorded without the usual immediate unhook.
        txn.insert_exclusion(Exclusion { id: Ulid::new(), event_id: g.event_id, start: at(15, 10) })
            .unwrap();

        let report = sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        assert_eq!(report.unhooked, 1);
        let kept = txn.find_occurrence(g.event_id, at(15, 10)).unwrap();
        assert_eq!(kept.generated_by, None);
        assert_eq!(owned_starts(&txn, &g).len(), 3);
    }

    #[test]
    fn shrinking_horizon_unhooks_without_deleting() {
        let (mut txn, g) = setup();
        sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        let total = txn.state().occurrences.len();

        let report = sync_candidates(&mut txn, &g, at(8, 23)).unwrap();
        assert_eq!(report.unhooked, 2);
        assert_eq!(txn.state().occurrences.len(), total);
        assert_eq!(owned_starts(&txn, &g), vec![at(1, 10), at(8, 10)]);
        assert!(txn.find_occurrence(g.event_id, at(22, 10)).unwrap().is_manual());
    }

    #[test]
    fn occupied_slot_is_left_alone() {
        let (mut txn, g) = setup();
        let manual = txn
            .create_manual_occurrence(Ulid::new(), Span::new(at(8, 10), at(8, 12)))
            .unwrap();
        let report = sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        assert_eq!(report.created, 3);
        let slot = txn.find_occurrence(g.event_id, at(8, 10)).unwrap();
        assert_eq!(slot.id, manual.id);
        assert!(slot.is_manual());
    }

    #[test]
    fn shift_moves_start_and_keeps_flags() {
        let (mut txn, g) = setup();
        sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        let mut first = txn.find_occurrence(g.event_id, at(1, 10)).unwrap();
        first.cancelled = true;
        txn.update_occurrence(first.clone()).unwrap();

        let mut later = g.clone();
        later.event_start = at(1, 12);
        later.event_end = at(1, 14);
        let shifted = shift_existing(&mut txn, &g, &later).unwrap();
        assert_eq!(shifted, 4);

        let moved = txn.occurrence(first.id).unwrap();
        assert_eq!(moved.varied, Span::new(at(1, 12), at(1, 14)));
        assert!(moved.cancelled);
        assert!(!moved.is_moved());
        assert_eq!(owned_starts(&txn, &g), vec![at(1, 12), at(8, 12), at(15, 12), at(22, 12)]);
    }

    #[test]
    fn shift_noop_when_times_unchanged() {
        let (mut txn, g) = setup();
        sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        let mut other = g.clone();
        other.repeat_until = Some(at(15, 23));
        assert_eq!(shift_existing(&mut txn, &g, &other).unwrap(), 0);
    }

    #[test]
    fn end_only_change_recomputes_end() {
        let (mut txn, g) = setup();
        sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        let mut longer = g.clone();
        longer.event_end = at(1, 13);
        shift_existing(&mut txn, &g, &longer).unwrap();
        for o in txn.list_occurrences(g.id) {
            assert_eq!(o.varied.duration(), TimeDelta::hours(3));
            assert_eq!(o.varied.start.time(), at(1, 10).time());
        }
    }

    #[test]
    fn user_moved_occurrence_survives_sync() {
        let (mut txn, g) = setup();
        sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        let mut o = txn.find_occurrence(g.event_id, at(8, 10)).unwrap();
        o.varied = Span::new(at(9, 18), at(9, 19));
        txn.update_occurrence(o.clone()).unwrap();

        let report = sync_candidates(&mut txn, &g, at(22, 23)).unwrap();
        assert!(report.is_noop());
        assert_eq!(txn.occurrence(o.id).unwrap().generated_by, Some(g.id));
    }
}
