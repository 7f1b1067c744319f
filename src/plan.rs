use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::rule::Rule;

/// Declarative description of events to create or update, read by the CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct Plan {
    pub events: Vec<EventPlan>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventPlan {
    /// Omit to create a fresh event on every run.
    pub id: Option<Ulid>,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub generators: Vec<GeneratorPlan>,
    #[serde(default)]
    pub exclusions: Vec<Ts>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorPlan {
    pub id: Option<Ulid>,
    pub start: Ts,
    pub end: Option<Ts>,
    pub rule: Option<Rule>,
    pub repeat_until: Option<Ts>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventSchedule {
    pub id: Ulid,
    #[serde(flatten)]
    pub details: EventDetails,
    pub occurrences: Vec<Occurrence>,
}

/// Create-or-update every event in the plan. Exclusions go in before
/// generators so excluded starts are never materialized in the first place.
pub async fn apply(engine: &Engine, plan: &Plan) -> Result<Vec<Ulid>, EngineError> {
    let mut applied = Vec::with_capacity(plan.events.len());
    for event in &plan.events {
        let id = event.id.unwrap_or_else(Ulid::new);
        let details = EventDetails {
            title: event.title.clone(),
            description: event.description.clone(),
        };
        match engine.get_event(id).await {
            Ok(_) => engine.update_event(id, details).await?,
            Err(EngineError::NotFound(_)) => engine.create_event(id, details).await?,
            Err(e) => return Err(e),
        }

        let existing: Vec<Ts> = engine
            .list_exclusions(id)
            .await?
            .into_iter()
            .map(|x| x.start)
            .collect();
        for start in &event.exclusions {
            if !existing.contains(start) {
                engine.create_exclusion(Ulid::new(), id, *start).await?;
            }
        }

        for g in &event.generators {
            let generator = Generator::new(
                g.id.unwrap_or_else(Ulid::new),
                id,
                GeneratorFields {
                    event_start: g.start,
                    event_end: g.end,
                    rule: g.rule.clone(),
                    repeat_until: g.repeat_until,
                },
            );
            engine.save_generator(generator, true).await?;
        }
        applied.push(id);
    }
    Ok(applied)
}

/// Every event with its occurrences in schedule order.
pub async fn render(engine: &Engine) -> Result<Vec<EventSchedule>, EngineError> {
    let mut out = Vec::new();
    for (id, details) in engine.list_events().await {
        let occurrences = engine.list_occurrences(id).await?;
        out.push(EventSchedule { id, details, occurrences });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::notify::NotifyHub;
    use std::sync::Arc;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("recurra_test_plan");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    const PLAN: &str = r#"{
        "events": [{
            "id": "01HQ3V8YJ5ZK6W2D9X4F7B1C0A",
            "title": "Choir practice",
            "generators": [{
                "id": "01HQ3V8YJ5ZK6W2D9X4F7B1C0B",
                "start": "2024-01-01T10:00:00Z",
                "end": "2024-01-01T11:00:00Z",
                "rule": "RRULE:FREQ=WEEKLY",
                "repeat_until": "2024-01-22T23:59:59Z"
            }],
            "exclusions": ["2024-01-08T10:00:00Z"]
        }]
    }"#;

    #[test]
    fn plan_parses() {
        let plan: Plan = serde_json::from_str(PLAN).unwrap();
        assert_eq!(plan.events.len(), 1);
        let g = &plan.events[0].generators[0];
        assert_eq!(g.rule.as_ref().unwrap().as_str(), "FREQ=WEEKLY");
        assert_eq!(plan.events[0].exclusions.len(), 1);
    }

    #[test]
    fn bad_rule_rejected_at_parse() {
        let bad = PLAN.replace("RRULE:FREQ=WEEKLY", "FREQ=SOMETIMES");
        assert!(serde_json::from_str::<Plan>(&bad).is_err());
    }

    #[tokio::test]
    async fn apply_is_repeatable() {
        let path = test_wal_path("apply_repeat.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();
        let plan: Plan = serde_json::from_str(PLAN).unwrap();

        let ids = apply(&engine, &plan).await.unwrap();
        let first = render(&engine).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, ids[0]);
        let starts: Vec<u32> = first[0]
            .occurrences
            .iter()
            .map(|o| chrono::Datelike::day(&o.varied.start))
            .collect();
        assert_eq!(starts, vec![1, 15, 22]);

        apply(&engine, &plan).await.unwrap();
        let second = render(&engine).await.unwrap();
        assert_eq!(second[0].occurrences, first[0].occurrences);
    }

    #[tokio::test]
    async fn schedule_serializes_flat() {
        let path = test_wal_path("render_json.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();
        let plan: Plan = serde_json::from_str(PLAN).unwrap();
        apply(&engine, &plan).await.unwrap();

        let json = serde_json::to_value(render(&engine).await.unwrap()).unwrap();
        assert_eq!(json[0]["title"], "Choir practice");
        assert_eq!(json[0]["occurrences"].as_array().unwrap().len(), 3);
    }
}
