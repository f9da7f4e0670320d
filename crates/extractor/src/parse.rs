//! AI response parsing: pull the JSON payload out of the model's text and
//! coerce it into typed entity/relation records.

use serde_json::Value;
use tracing::warn;

use crate::types::{
    EntityKind, ExtractedEntity, ExtractedPlot, ExtractedRelation, PlotParticipant, PlotRelation,
};

/// Find and parse the JSON object inside a model response. Models often
/// wrap the payload in prose or code fences, so the outermost brace pair
/// is tried first, the raw text second.
pub fn parse_payload(text: &str) -> Option<Value> {
    let start = text.find('{');
    let end = text.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            if let Ok(value) = serde_json::from_str(&text[start..=end]) {
                return Some(value);
            }
        }
    }
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "response is not parseable JSON");
            None
        }
    }
}

fn str_field(item: &Value, field: &str) -> String {
    item[field].as_str().unwrap_or_default().trim().to_string()
}

fn collect_entities(
    payload: &Value,
    key: &str,
    kind: EntityKind,
    chapter_id: i64,
    novel_id: i64,
    out: &mut Vec<ExtractedEntity>,
) {
    let Some(items) = payload[key].as_array() else { return };
    for item in items {
        let name = str_field(item, "name");
        if name.is_empty() {
            continue;
        }
        out.push(ExtractedEntity {
            name,
            kind,
            description: str_field(item, "description"),
            chapter_id,
            novel_id,
        });
    }
}

/// Entities from the entity-prompt payload.
pub fn entities_from_payload(payload: &Value, chapter_id: i64, novel_id: i64) -> Vec<ExtractedEntity> {
    let mut out = Vec::new();
    collect_entities(payload, "characters", EntityKind::Character, chapter_id, novel_id, &mut out);
    collect_entities(payload, "locations", EntityKind::Location, chapter_id, novel_id, &mut out);
    collect_entities(payload, "organizations", EntityKind::Organization, chapter_id, novel_id, &mut out);
    collect_entities(payload, "events", EntityKind::Event, chapter_id, novel_id, &mut out);
    out
}

/// Relations from the relation-prompt payload. Event participation maps to
/// `PARTICIPATES_IN`, event placement to `OCCURS_IN`.
pub fn relations_from_payload(payload: &Value, chapter_id: i64, novel_id: i64) -> Vec<ExtractedRelation> {
    let mut out = Vec::new();

    if let Some(items) = payload["character_relationships"].as_array() {
        for item in items {
            let from = str_field(item, "from");
            let to = str_field(item, "to");
            let relation = str_field(item, "relation").to_uppercase();
            if from.is_empty() || to.is_empty() || relation.is_empty() {
                continue;
            }
            out.push(ExtractedRelation {
                from,
                to,
                relation,
                description: str_field(item, "description"),
                chapter_id,
                novel_id,
            });
        }
    }

    if let Some(items) = payload["event_relationships"].as_array() {
        for item in items {
            let character = str_field(item, "character");
            let event = str_field(item, "event");
            if character.is_empty() || event.is_empty() {
                continue;
            }
            out.push(ExtractedRelation {
                from: character,
                to: event,
                relation: "PARTICIPATES_IN".to_string(),
                description: str_field(item, "role"),
                chapter_id,
                novel_id,
            });
        }
    }

    if let Some(items) = payload["location_relationships"].as_array() {
        for item in items {
            let event = str_field(item, "event");
            let location = str_field(item, "location");
            if event.is_empty() || location.is_empty() {
                continue;
            }
            out.push(ExtractedRelation {
                from: event,
                to: location,
                relation: "OCCURS_IN".to_string(),
                description: String::new(),
                chapter_id,
                novel_id,
            });
        }
    }

    out
}

/// Plots and plot-to-plot relations from the plot-prompt payload.
pub fn plots_from_payload(payload: &Value) -> (Vec<ExtractedPlot>, Vec<PlotRelation>) {
    let mut plots = Vec::new();
    if let Some(items) = payload["plots"].as_array() {
        for item in items {
            let name = str_field(item, "name");
            if name.is_empty() {
                continue;
            }
            let events = item["events"]
                .as_array()
                .map(|events| {
                    events
                        .iter()
                        .filter_map(|e| e.as_str())
                        .map(|e| e.trim().to_string())
                        .filter(|e| !e.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            let characters = item["characters"]
                .as_array()
                .map(|chars| {
                    chars
                        .iter()
                        .filter_map(|c| {
                            let name = str_field(c, "name");
                            if name.is_empty() {
                                return None;
                            }
                            Some(PlotParticipant { name, role: str_field(c, "role") })
                        })
                        .collect()
                })
                .unwrap_or_default();
            plots.push(ExtractedPlot {
                name,
                description: str_field(item, "description"),
                events,
                characters,
            });
        }
    }

    let mut relations = Vec::new();
    if let Some(items) = payload["plot_relationships"].as_array() {
        for item in items {
            let from = str_field(item, "from");
            let to = str_field(item, "to");
            let relation = str_field(item, "relation").to_uppercase();
            if from.is_empty() || to.is_empty() || relation.is_empty() {
                continue;
            }
            relations.push(PlotRelation { from, to, relation });
        }
    }

    (plots, relations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_found_inside_prose() {
        let text = "Sure! Here is the JSON:\n{\"characters\": [{\"name\": \"Ana\"}]}\nHope that helps.";
        let payload = parse_payload(text).unwrap();
        assert!(payload["characters"].is_array());
    }

    #[test]
    fn garbage_yields_none() {
        assert!(parse_payload("no json here").is_none());
        assert!(parse_payload("{broken").is_none());
    }

    #[test]
    fn entities_attach_chapter_and_novel_scope() {
        let payload = serde_json::json!({
            "characters": [{ "name": "Ana", "description": "a swordswoman" }],
            "locations": [{ "name": "Harbor" }],
            "organizations": [],
            "events": [{ "name": "The duel", "participants": ["Ana"] }]
        });
        let entities = entities_from_payload(&payload, 12, 3);
        assert_eq!(entities.len(), 3);
        assert!(entities.iter().all(|e| e.chapter_id == 12 && e.novel_id == 3));
        assert_eq!(entities[0].kind, EntityKind::Character);
        assert_eq!(entities[0].description, "a swordswoman");
    }

    #[test]
    fn nameless_entries_are_dropped() {
        let payload = serde_json::json!({ "characters": [{ "description": "no name" }, { "name": "  " }] });
        assert!(entities_from_payload(&payload, 1, 1).is_empty());
    }

    #[test]
    fn relation_kinds_are_mapped() {
        let payload = serde_json::json!({
            "character_relationships": [
                { "from": "Ana", "to": "Bram", "relation": "friend" }
            ],
            "event_relationships": [
                { "character": "Ana", "event": "The duel", "role": "challenger" }
            ],
            "location_relationships": [
                { "event": "The duel", "location": "Harbor" }
            ]
        });
        let relations = relations_from_payload(&payload, 12, 3);
        assert_eq!(relations.len(), 3);
        assert_eq!(relations[0].relation, "FRIEND");
        assert_eq!(relations[1].relation, "PARTICIPATES_IN");
        assert_eq!(relations[1].description, "challenger");
        assert_eq!(relations[2].relation, "OCCURS_IN");
    }

    #[test]
    fn plots_carry_events_and_participants() {
        let payload = serde_json::json!({
            "plots": [
                {
                    "name": "The harbor conspiracy",
                    "description": "smugglers close in",
                    "events": ["The duel", "  ", "The ambush"],
                    "characters": [
                        { "name": "Ana", "role": "protagonist" },
                        { "role": "nameless is dropped" }
                    ]
                },
                { "description": "nameless plot is dropped" }
            ],
            "plot_relationships": [
                { "from": "The harbor conspiracy", "to": "The siege", "relation": "precedes" },
                { "from": "", "to": "The siege", "relation": "INCLUDES" }
            ]
        });
        let (plots, relations) = plots_from_payload(&payload);
        assert_eq!(plots.len(), 1);
        assert_eq!(plots[0].events, vec!["The duel", "The ambush"]);
        assert_eq!(plots[0].characters.len(), 1);
        assert_eq!(plots[0].characters[0].role, "protagonist");
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].relation, "PRECEDES");
    }
}
