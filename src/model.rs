use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, NaiveTime, SubsecRound, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::ValidationError;
use crate::rule::Rule;

/// UTC instant. All times in the engine use it.
pub type Ts = DateTime<Utc>;

/// Closed-open time range `[start, end)`. Zero length is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: Ts,
    pub end: Ts,
}

impl Span {
    pub fn new(start: Ts, end: Ts) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn shifted(&self, by: TimeDelta) -> Self {
        Self::new(self.start + by, self.end + by)
    }

    /// Same start, new length.
    pub fn with_duration(&self, duration: TimeDelta) -> Self {
        Self::new(self.start, self.start + duration)
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start.date_naive()
    }

    pub fn start_time(&self) -> NaiveTime {
        self.start.time()
    }

    pub fn end_date(&self) -> NaiveDate {
        self.end.date_naive()
    }

    pub fn end_time(&self) -> NaiveTime {
        self.end.time()
    }
}

/// Last representable second of a calendar day. Date-only bounds such as
/// "repeat until Jan 22" cover the whole day.
pub fn end_of_day(date: NaiveDate) -> Ts {
    let last = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&date.and_time(last))
}

// ── Event content ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetails {
    pub title: String,
    pub description: Option<String>,
}

impl EventDetails {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
        }
    }
}

/// Per-occurrence replacement of the event's displayed details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationRecord {
    pub details: EventDetails,
    pub reason: Option<String>,
}

// ── Generator ────────────────────────────────────────────────────

/// Caller-supplied generator fields, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorFields {
    pub event_start: Ts,
    /// Defaults to `event_start` when omitted.
    pub event_end: Option<Ts>,
    pub rule: Option<Rule>,
    pub repeat_until: Option<Ts>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generator {
    pub id: Ulid,
    pub event_id: Ulid,
    pub event_start: Ts,
    pub event_end: Ts,
    pub rule: Option<Rule>,
    pub repeat_until: Option<Ts>,
}

impl Generator {
    pub fn new(id: Ulid, event_id: Ulid, fields: GeneratorFields) -> Self {
        let event_start = fields.event_start;
        Self {
            id,
            event_id,
            event_start,
            event_end: fields.event_end.unwrap_or(event_start),
            rule: fields.rule,
            repeat_until: fields.repeat_until,
        }
        .normalized()
    }

    /// Copy with every timestamp truncated to whole seconds. The rule iterator
    /// yields whole seconds, so a sub-second anchor would never match its own
    /// first candidate.
    pub fn normalized(&self) -> Self {
        Self {
            event_start: self.event_start.trunc_subsecs(0),
            event_end: self.event_end.trunc_subsecs(0),
            repeat_until: self.repeat_until.map(|u| u.trunc_subsecs(0)),
            ..self.clone()
        }
    }

    pub fn duration(&self) -> TimeDelta {
        self.event_end - self.event_start
    }

    pub fn span(&self) -> Span {
        Span::new(self.event_start, self.event_end.max(self.event_start))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let Some(rule) = &self.rule else {
            return Err(ValidationError::MissingRule);
        };
        if self.event_start > self.event_end {
            return Err(ValidationError::StartAfterEnd {
                start: self.event_start,
                end: self.event_end,
            });
        }
        if let Some(until) = self.repeat_until
            && until < self.event_end
        {
            return Err(ValidationError::RepeatUntilBeforeEnd {
                repeat_until: until,
                end: self.event_end,
            });
        }
        // Common data-entry mistake: a daily event typed with a multi-day end.
        if rule.is_daily() && self.duration() > TimeDelta::days(1) {
            return Err(ValidationError::DailySpansMultipleDays {
                duration: self.duration(),
            });
        }
        Ok(())
    }

    /// Compact description of what this generator produces. `owned` are the
    /// occurrences it currently generates.
    pub fn spans(&self, owned: &[Occurrence]) -> GeneratorSpans {
        match &self.rule {
            Some(rule) if owned.len() > 3 => GeneratorSpans::Repeating {
                span: self.span(),
                rule: rule.clone(),
                until: self.repeat_until,
            },
            Some(_) => {
                let mut spans: Vec<Span> = owned.iter().map(|o| o.varied).collect();
                spans.sort();
                GeneratorSpans::Listed(spans)
            }
            None => GeneratorSpans::Listed(vec![self.span()]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorSpans {
    Repeating {
        span: Span,
        rule: Rule,
        until: Option<Ts>,
    },
    Listed(Vec<Span>),
}

// ── Occurrence ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: Ulid,
    pub event_id: Ulid,
    /// `None` for manual or unhooked occurrences.
    pub generated_by: Option<Ulid>,
    /// Schedule as generated; identity key together with `generated_by`.
    pub unvaried: Span,
    /// Actual current schedule.
    pub varied: Span,
    pub cancelled: bool,
    pub hide_from_lists: bool,
    pub full: bool,
    pub content_override: Option<VariationRecord>,
}

impl Occurrence {
    pub fn new(id: Ulid, event_id: Ulid, generated_by: Option<Ulid>, span: Span) -> Self {
        Self {
            id,
            event_id,
            generated_by,
            unvaried: span,
            varied: span,
            cancelled: false,
            hide_from_lists: false,
            full: false,
            content_override: None,
        }
    }

    pub fn is_moved(&self) -> bool {
        self.varied != self.unvaried
    }

    pub fn is_varied(&self) -> bool {
        self.content_override.is_some()
            || self.is_moved()
            || self.cancelled
            || self.hide_from_lists
            || self.full
    }

    pub fn is_manual(&self) -> bool {
        self.generated_by.is_none()
    }

    pub fn effective_details<'a>(&'a self, base: &'a EventDetails) -> &'a EventDetails {
        self.content_override.as_ref().map_or(base, |v| &v.details)
    }

    /// Why this occurrence differs from its generated schedule, most significant first.
    pub fn variation_reason(&self) -> Option<VariationReason> {
        if let Some(v) = &self.content_override {
            return Some(VariationReason::Content(v.reason.clone()));
        }
        if self.cancelled {
            return Some(VariationReason::Cancelled);
        }
        if self.full {
            return Some(VariationReason::FullyBooked);
        }
        if self.hide_from_lists {
            return Some(VariationReason::Hidden);
        }
        if !self.is_moved() {
            return None;
        }

        let new_date = self.varied.start_date() != self.unvaried.start_date();
        let (vs, us) = (self.varied.start_time(), self.unvaried.start_time());
        let (ve, ue) = (self.varied.end_time(), self.unvaried.end_time());
        let timing = if vs < us {
            Some(TimingChange::StartsEarlier)
        } else if vs > us {
            Some(TimingChange::StartsLater)
        } else if ve < ue {
            Some(TimingChange::EndsEarlier)
        } else if ve > ue {
            Some(TimingChange::EndsLater)
        } else {
            None
        };
        Some(VariationReason::Moved { new_date, timing })
    }

    pub(crate) fn sort_key(&self) -> (Span, Span, Ulid) {
        (self.varied, self.unvaried, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VariationReason {
    Content(Option<String>),
    Cancelled,
    FullyBooked,
    Hidden,
    Moved {
        new_date: bool,
        timing: Option<TimingChange>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimingChange {
    StartsEarlier,
    StartsLater,
    EndsEarlier,
    EndsLater,
}

// ── Exclusion ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub id: Ulid,
    pub event_id: Ulid,
    pub start: Ts,
}

// ── Per-event state ──────────────────────────────────────────────

/// Everything one event owns. The unit of locking and of atomic commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventState {
    pub id: Ulid,
    pub details: EventDetails,
    /// Number of commits applied; used for optimistic conflict detection.
    pub version: u64,
    pub generators: BTreeMap<Ulid, Generator>,
    pub occurrences: BTreeMap<Ulid, Occurrence>,
    pub exclusions: BTreeMap<Ulid, Exclusion>,
    /// Occurrence ids keyed by unvaried start.
    by_start: BTreeMap<Ts, BTreeSet<Ulid>>,
}

impl EventState {
    pub fn new(id: Ulid, details: EventDetails) -> Self {
        Self {
            id,
            details,
            version: 0,
            generators: BTreeMap::new(),
            occurrences: BTreeMap::new(),
            exclusions: BTreeMap::new(),
            by_start: BTreeMap::new(),
        }
    }

    /// Insert or replace an occurrence, keeping the start index current.
    pub fn upsert_occurrence(&mut self, occurrence: Occurrence) {
        if let Some(old) = self.occurrences.get(&occurrence.id) {
            let old_start = old.unvaried.start;
            self.unindex(old_start, occurrence.id);
        }
        self.by_start
            .entry(occurrence.unvaried.start)
            .or_default()
            .insert(occurrence.id);
        self.occurrences.insert(occurrence.id, occurrence);
    }

    pub fn remove_occurrence(&mut self, id: Ulid) -> Option<Occurrence> {
        let removed = self.occurrences.remove(&id)?;
        self.unindex(removed.unvaried.start, id);
        Some(removed)
    }

    fn unindex(&mut self, start: Ts, id: Ulid) {
        if let Some(ids) = self.by_start.get_mut(&start) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_start.remove(&start);
            }
        }
    }

    /// All occurrences whose unvaried start is `start`, earliest created first.
    pub fn occurrences_at(&self, start: Ts) -> impl Iterator<Item = &Occurrence> {
        self.by_start
            .get(&start)
            .into_iter()
            .flatten()
            .filter_map(|id| self.occurrences.get(id))
    }

    pub fn occurrences_of(&self, generator_id: Ulid) -> impl Iterator<Item = &Occurrence> {
        self.occurrences
            .values()
            .filter(move |o| o.generated_by == Some(generator_id))
    }

    pub fn exclusion_at(&self, start: Ts) -> Option<&Exclusion> {
        self.exclusions.values().find(|x| x.start == start)
    }

    /// Occurrences whose varied span intersects `[from, to)`, in schedule order.
    /// Zero-length occurrences count when their instant falls inside the window.
    pub fn occurrences_between(&self, from: Ts, to: Ts) -> Vec<&Occurrence> {
        let mut hits: Vec<&Occurrence> = self
            .occurrences
            .values()
            .filter(|o| o.varied.start < to && (o.varied.end > from || o.varied.start >= from))
            .collect();
        hits.sort_by_key(|o| o.sort_key());
        hits
    }
}

// ── WAL record format ────────────────────────────────────────────

/// One state change inside a commit. Records carry full snapshots so replay is
/// a plain upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    EventCreated { id: Ulid, details: EventDetails },
    EventUpdated { id: Ulid, details: EventDetails },
    EventDeleted { id: Ulid },
    GeneratorSaved(Generator),
    GeneratorDeleted { id: Ulid },
    OccurrenceCreated(Occurrence),
    OccurrenceUpdated(Occurrence),
    OccurrenceDeleted { id: Ulid },
    ExclusionCreated(Exclusion),
    ExclusionDeleted { id: Ulid },
}

impl Change {
    /// Id of the generator, occurrence or exclusion this change touches.
    pub fn entity_id(&self) -> Option<Ulid> {
        match self {
            Change::GeneratorSaved(g) => Some(g.id),
            Change::OccurrenceCreated(o) | Change::OccurrenceUpdated(o) => Some(o.id),
            Change::ExclusionCreated(x) => Some(x.id),
            Change::GeneratorDeleted { id }
            | Change::OccurrenceDeleted { id }
            | Change::ExclusionDeleted { id } => Some(*id),
            Change::EventCreated { .. } | Change::EventUpdated { .. } | Change::EventDeleted { .. } => {
                None
            }
        }
    }
}

/// The atomic unit written to the WAL: every change of one transaction on one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub event_id: Ulid,
    pub changes: Vec<Change>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(d: u32, h: u32) -> Ts {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    fn weekly() -> Option<Rule> {
        Some(Rule::parse("FREQ=WEEKLY").unwrap())
    }

    fn generator(start: Ts, end: Option<Ts>, rule: Option<Rule>, until: Option<Ts>) -> Generator {
        Generator::new(
            Ulid::new(),
            Ulid::new(),
            GeneratorFields {
                event_start: start,
                event_end: end,
                rule,
                repeat_until: until,
            },
        )
    }

    #[test]
    fn span_accessors() {
        let s = Span::new(at(1, 10), at(2, 11));
        assert_eq!(s.duration(), TimeDelta::hours(25));
        assert_eq!(s.start_date(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(s.end_time(), NaiveTime::from_hms_opt(11, 0, 0).unwrap());
        assert_eq!(s.shifted(TimeDelta::hours(1)), Span::new(at(1, 11), at(2, 12)));
        assert_eq!(s.with_duration(TimeDelta::zero()), Span::new(at(1, 10), at(1, 10)));
    }

    #[test]
    fn end_of_day_is_last_second() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 22).unwrap();
        assert_eq!(end_of_day(d), Utc.with_ymd_and_hms(2024, 1, 22, 23, 59, 59).unwrap());
    }

    #[test]
    fn generator_end_defaults_to_start_and_truncates() {
        let start = at(1, 10) + TimeDelta::milliseconds(450);
        let g = generator(start, None, weekly(), None);
        assert_eq!(g.event_start, at(1, 10));
        assert_eq!(g.event_end, at(1, 10));
        assert_eq!(g.duration(), TimeDelta::zero());
        assert!(g.validate().is_ok());
    }

    #[test]
    fn validate_requires_rule() {
        let g = generator(at(1, 10), Some(at(1, 11)), None, None);
        assert_eq!(g.validate(), Err(ValidationError::MissingRule));
    }

    #[test]
    fn validate_start_after_end() {
        let g = generator(at(1, 12), Some(at(1, 11)), weekly(), None);
        assert!(matches!(g.validate(), Err(ValidationError::StartAfterEnd { .. })));
    }

    #[test]
    fn validate_repeat_until_before_end() {
        let g = generator(at(1, 10), Some(at(1, 11)), weekly(), Some(at(1, 10)));
        assert!(matches!(g.validate(), Err(ValidationError::RepeatUntilBeforeEnd { .. })));
        let ok = generator(at(1, 10), Some(at(1, 11)), weekly(), Some(at(1, 11)));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn validate_daily_multi_day() {
        let daily = Some(Rule::parse("FREQ=DAILY").unwrap());
        let g = generator(at(1, 10), Some(at(2, 11)), daily.clone(), None);
        assert!(matches!(g.validate(), Err(ValidationError::DailySpansMultipleDays { .. })));
        // Exactly one day is fine; weekly rules may span days.
        assert!(generator(at(1, 10), Some(at(2, 10)), daily, None).validate().is_ok());
        assert!(generator(at(1, 10), Some(at(3, 10)), weekly(), None).validate().is_ok());
    }

    #[test]
    fn occurrence_defaults_and_variation() {
        let span = Span::new(at(1, 10), at(1, 11));
        let mut o = Occurrence::new(Ulid::new(), Ulid::new(), None, span);
        assert_eq!(o.varied, o.unvaried);
        assert!(!o.is_moved());
        assert!(!o.is_varied());
        assert_eq!(o.variation_reason(), None);

        o.full = true;
        assert!(o.is_varied());
        assert_eq!(o.variation_reason(), Some(VariationReason::FullyBooked));

        o.cancelled = true;
        assert_eq!(o.variation_reason(), Some(VariationReason::Cancelled));

        o.content_override = Some(VariationRecord {
            details: EventDetails::titled("Matinee"),
            reason: Some("guest speaker".into()),
        });
        assert_eq!(
            o.variation_reason(),
            Some(VariationReason::Content(Some("guest speaker".into())))
        );
    }

    #[test]
    fn moved_reasons() {
        let span = Span::new(at(1, 10), at(1, 11));
        let mut o = Occurrence::new(Ulid::new(), Ulid::new(), None, span);

        o.varied = Span::new(at(1, 9), at(1, 11));
        assert_eq!(
            o.variation_reason(),
            Some(VariationReason::Moved { new_date: false, timing: Some(TimingChange::StartsEarlier) })
        );

        o.varied = Span::new(at(2, 10), at(2, 12));
        assert_eq!(
            o.variation_reason(),
            Some(VariationReason::Moved { new_date: true, timing: Some(TimingChange::EndsLater) })
        );

        o.varied = Span::new(at(3, 10), at(3, 11));
        assert_eq!(
            o.variation_reason(),
            Some(VariationReason::Moved { new_date: true, timing: None })
        );
    }

    #[test]
    fn effective_details_prefers_override() {
        let base = EventDetails::titled("Concert");
        let span = Span::new(at(1, 10), at(1, 11));
        let mut o = Occurrence::new(Ulid::new(), Ulid::new(), None, span);
        assert_eq!(o.effective_details(&base).title, "Concert");
        o.content_override = Some(VariationRecord {
            details: EventDetails::titled("Encore"),
            reason: None,
        });
        assert_eq!(o.effective_details(&base).title, "Encore");
    }

    #[test]
    fn spans_summary() {
        let g = generator(at(1, 10), Some(at(1, 11)), weekly(), None);
        let make = |d| Occurrence::new(Ulid::new(), g.event_id, Some(g.id), Span::new(at(d, 10), at(d, 11)));

        let few = vec![make(15), make(1), make(8)];
        assert_eq!(
            g.spans(&few),
            GeneratorSpans::Listed(vec![
                Span::new(at(1, 10), at(1, 11)),
                Span::new(at(8, 10), at(8, 11)),
                Span::new(at(15, 10), at(15, 11)),
            ])
        );

        let many = vec![make(1), make(8), make(15), make(22)];
        assert!(matches!(g.spans(&many), GeneratorSpans::Repeating { until: None, .. }));

        let once = generator(at(1, 10), Some(at(1, 11)), None, None);
        assert_eq!(once.spans(&[]), GeneratorSpans::Listed(vec![once.span()]));
    }

    #[test]
    fn state_start_index_follows_upserts() {
        let mut st = EventState::new(Ulid::new(), EventDetails::titled("e"));
        let a = Occurrence::new(Ulid::from_parts(1, 1), st.id, None, Span::new(at(1, 10), at(1, 11)));
        let mut b = a.clone();
        b.id = Ulid::from_parts(1, 2);
        st.upsert_occurrence(a.clone());
        st.upsert_occurrence(b.clone());
        let ids: Vec<Ulid> = st.occurrences_at(at(1, 10)).map(|o| o.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        let mut moved = a.clone();
        moved.unvaried = moved.unvaried.shifted(TimeDelta::days(1));
        st.upsert_occurrence(moved);
        assert_eq!(st.occurrences_at(at(1, 10)).count(), 1);
        assert_eq!(st.occurrences_at(at(2, 10)).count(), 1);

        st.remove_occurrence(b.id);
        assert_eq!(st.occurrences_at(at(1, 10)).count(), 0);
        assert!(st.remove_occurrence(b.id).is_none());
    }

    #[test]
    fn occurrences_between_uses_varied_span() {
        let mut st = EventState::new(Ulid::new(), EventDetails::titled("e"));
        for d in [1, 8, 15] {
            st.upsert_occurrence(Occurrence::new(
                Ulid::new(),
                st.id,
                None,
                Span::new(at(d, 10), at(d, 11)),
            ));
        }
        let hits = st.occurrences_between(at(5, 0), at(16, 0));
        let starts: Vec<Ts> = hits.iter().map(|o| o.varied.start).collect();
        assert_eq!(starts, vec![at(8, 10), at(15, 10)]);
        // Half-open: ending exactly at the window start is outside.
        assert!(st.occurrences_between(at(1, 11), at(1, 12)).is_empty());
    }

    #[test]
    fn commit_bincode_roundtrip() {
        let g = generator(at(1, 10), Some(at(1, 11)), weekly(), Some(at(22, 23)));
        let commit = Commit {
            event_id: g.event_id,
            changes: vec![
                Change::GeneratorSaved(g.clone()),
                Change::OccurrenceCreated(Occurrence::new(Ulid::new(), g.event_id, Some(g.id), g.span())),
            ],
        };
        let bytes = bincode::serialize(&commit).unwrap();
        let decoded: Commit = bincode::deserialize(&bytes).unwrap();
        assert_eq!(commit, decoded);
    }
}
