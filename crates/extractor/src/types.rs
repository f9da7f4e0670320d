use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Character,
    Location,
    Organization,
    Event,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Character => "character",
            EntityKind::Location => "location",
            EntityKind::Organization => "organization",
            EntityKind::Event => "event",
        }
    }
}

/// An entity pulled out of one chapter, pinned to its novel and the task
/// that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub kind: EntityKind,
    pub description: String,
    pub chapter_id: i64,
    pub novel_id: i64,
}

/// A relation between two named entities in one chapter. `from`/`to` are
/// entity names; event endpoints are resolved to hashed event ids at graph
/// write time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub from: String,
    pub to: String,
    pub relation: String,
    pub description: String,
    pub chapter_id: i64,
    pub novel_id: i64,
}

/// A character's involvement in a plot line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotParticipant {
    pub name: String,
    /// protagonist / antagonist / supporter / witness.
    pub role: String,
}

/// A plot line surfaced by one chapter, with the events and characters
/// that advance it. Plot identity is (novel, name); chapters sharing a
/// plot name merge into the same node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedPlot {
    pub name: String,
    pub description: String,
    pub events: Vec<String>,
    pub characters: Vec<PlotParticipant>,
}

/// A name-based plot-to-plot relation; resolved to plot ids at graph
/// write time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotRelation {
    pub from: String,
    pub to: String,
    pub relation: String,
}

/// Drop duplicate entities, keeping the first occurrence of each
/// (kind, name) pair.
pub fn dedupe_entities(entities: Vec<ExtractedEntity>) -> Vec<ExtractedEntity> {
    let mut seen = std::collections::HashSet::new();
    entities
        .into_iter()
        .filter(|e| seen.insert((e.kind, e.name.clone())))
        .collect()
}

/// Drop duplicate relations, keeping the first (from, relation, to) triple.
pub fn dedupe_relations(relations: Vec<ExtractedRelation>) -> Vec<ExtractedRelation> {
    let mut seen = std::collections::HashSet::new();
    relations
        .into_iter()
        .filter(|r| seen.insert((r.from.clone(), r.relation.clone(), r.to.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(kind: EntityKind, name: &str) -> ExtractedEntity {
        ExtractedEntity {
            name: name.to_string(),
            kind,
            description: String::new(),
            chapter_id: 1,
            novel_id: 1,
        }
    }

    #[test]
    fn dedupe_keeps_first_of_each_identity() {
        let out = dedupe_entities(vec![
            entity(EntityKind::Character, "Ana"),
            entity(EntityKind::Character, "Ana"),
            entity(EntityKind::Location, "Ana"),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn dedupe_relations_by_triple() {
        let rel = |from: &str, relation: &str, to: &str| ExtractedRelation {
            from: from.into(),
            to: to.into(),
            relation: relation.into(),
            description: String::new(),
            chapter_id: 1,
            novel_id: 1,
        };
        let out = dedupe_relations(vec![
            rel("a", "KNOWS", "b"),
            rel("a", "KNOWS", "b"),
            rel("a", "LOVES", "b"),
            rel("b", "KNOWS", "a"),
        ]);
        assert_eq!(out.len(), 3);
    }
}
