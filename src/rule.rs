use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use rrule::{Frequency, RRule, RRuleSet, Tz, Unvalidated};
use serde::{Deserialize, Serialize};

use crate::engine::{EngineError, ValidationError};
use crate::limits::{MAX_CANDIDATES_PER_GENERATOR, MAX_RULE_LEN};

/// A recurrence descriptor: the body of an RFC 5545 RRULE, e.g. `FREQ=WEEKLY;BYDAY=MO`.
///
/// The text is checked by the rrule parser on construction and stored verbatim,
/// so a `Rule` that exists always parses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rule {
    text: String,
    daily: bool,
}

impl Rule {
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let trimmed = text.trim();
        let body = trimmed
            .strip_prefix("RRULE:")
            .or_else(|| trimmed.strip_prefix("rrule:"))
            .unwrap_or(trimmed);
        if body.is_empty() {
            return Err(ValidationError::InvalidRule("empty rule".into()));
        }
        if body.len() > MAX_RULE_LEN {
            return Err(ValidationError::InvalidRule("rule too long".into()));
        }
        let parsed = parse_rrule(body)?;
        Ok(Self {
            text: body.to_string(),
            daily: matches!(parsed.get_freq(), Frequency::Daily),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Daily rules constrain the generator duration to at most one day.
    pub fn is_daily(&self) -> bool {
        self.daily
    }

    /// Bind the rule to an anchor start, producing the lazily advancing rrule set.
    fn build(&self, anchor: DateTime<Utc>) -> Result<RRuleSet, ValidationError> {
        parse_rrule(&self.text)?
            .build(anchor.with_timezone(&Tz::UTC))
            .map_err(|e| ValidationError::InvalidRule(e.to_string()))
    }
}

fn parse_rrule(body: &str) -> Result<RRule<Unvalidated>, ValidationError> {
    body.parse::<RRule<Unvalidated>>()
        .map_err(|e| ValidationError::InvalidRule(e.to_string()))
}

impl FromStr for Rule {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Rule {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Rule> for String {
    fn from(rule: Rule) -> Self {
        rule.text
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// The farthest start a generator may materialize: its `repeat_until` bound,
/// or `now + default_limit` for open-ended rules.
pub fn horizon(
    repeat_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    default_limit: TimeDelta,
) -> DateTime<Utc> {
    repeat_until.unwrap_or(now + default_limit)
}

/// Expand a rule into candidate starts in `[anchor, horizon]`.
///
/// The rrule iterator may be infinite; iteration stops at the first candidate
/// past `horizon`. Output is strictly increasing. Without a rule the single
/// candidate is `anchor` itself.
pub fn expand(
    rule: Option<&Rule>,
    anchor: DateTime<Utc>,
    horizon: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, EngineError> {
    let Some(rule) = rule else {
        return Ok(vec![anchor]);
    };
    let set = rule.build(anchor)?;

    let mut candidates: Vec<DateTime<Utc>> = Vec::new();
    for dt in &set {
        let dt = dt.with_timezone(&Utc);
        if dt > horizon {
            break;
        }
        if dt < anchor || candidates.last().is_some_and(|last| *last >= dt) {
            continue;
        }
        if candidates.len() >= MAX_CANDIDATES_PER_GENERATOR {
            return Err(EngineError::LimitExceeded("too many candidates before horizon"));
        }
        candidates.push(dt);
    }
    tracing::trace!(rule = %rule, %anchor, %horizon, count = candidates.len(), "expanded rule");
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn parse_accepts_prefix_and_detects_daily() {
        let r = Rule::parse("RRULE:FREQ=DAILY;INTERVAL=2").unwrap();
        assert_eq!(r.as_str(), "FREQ=DAILY;INTERVAL=2");
        assert!(r.is_daily());

        let w = Rule::parse("FREQ=WEEKLY").unwrap();
        assert!(!w.is_daily());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(Rule::parse("FREQ=SOMETIMES"), Err(ValidationError::InvalidRule(_))));
        assert!(matches!(Rule::parse("   "), Err(ValidationError::InvalidRule(_))));
        let long = format!("FREQ=DAILY;{}", "X".repeat(MAX_RULE_LEN));
        assert!(Rule::parse(&long).is_err());
    }

    #[test]
    fn serde_uses_rule_text() {
        let r = Rule::parse("FREQ=WEEKLY;BYDAY=MO,WE").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"FREQ=WEEKLY;BYDAY=MO,WE\"");
        let back: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
        assert!(serde_json::from_str::<Rule>("\"FREQ=NEVER\"").is_err());
    }

    #[test]
    fn no_rule_yields_anchor_only() {
        let anchor = at(2024, 1, 1, 10);
        let out = expand(None, anchor, at(2023, 1, 1, 0)).unwrap();
        assert_eq!(out, vec![anchor]);
    }

    #[test]
    fn weekly_until_inclusive_horizon() {
        let rule = Rule::parse("FREQ=WEEKLY").unwrap();
        let anchor = at(2024, 1, 1, 10);
        let out = expand(Some(&rule), anchor, at(2024, 1, 22, 10)).unwrap();
        assert_eq!(
            out,
            vec![at(2024, 1, 1, 10), at(2024, 1, 8, 10), at(2024, 1, 15, 10), at(2024, 1, 22, 10)]
        );
    }

    #[test]
    fn open_ended_rule_stops_at_horizon() {
        let rule = Rule::parse("FREQ=DAILY").unwrap();
        let now = at(2024, 3, 1, 0);
        let anchor = at(2024, 3, 1, 9);
        let h = horizon(None, now, TimeDelta::days(10));
        assert_eq!(h, at(2024, 3, 11, 0));
        let out = expand(Some(&rule), anchor, h).unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(*out.last().unwrap(), at(2024, 3, 10, 9));
        assert!(out.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn repeat_until_overrides_default_limit() {
        let now = at(2024, 1, 1, 0);
        let until = at(2024, 2, 1, 0);
        assert_eq!(horizon(Some(until), now, TimeDelta::days(365)), until);
    }

    #[test]
    fn count_rule_ends_before_horizon() {
        let rule = Rule::parse("FREQ=DAILY;COUNT=3").unwrap();
        let anchor = at(2024, 1, 1, 8);
        let out = expand(Some(&rule), anchor, at(2030, 1, 1, 0)).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn horizon_before_anchor_yields_nothing() {
        let rule = Rule::parse("FREQ=WEEKLY").unwrap();
        let out = expand(Some(&rule), at(2024, 1, 8, 10), at(2024, 1, 1, 0)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn runaway_expansion_is_capped() {
        let rule = Rule::parse("FREQ=HOURLY").unwrap();
        let anchor = at(2024, 1, 1, 0);
        let result = expand(Some(&rule), anchor, at(2026, 1, 1, 0));
        assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
    }
}
