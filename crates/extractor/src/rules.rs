//! Deterministic regex extraction, the backend of the synthetic `rules`
//! provider. Pattern lists can be overridden per deployment through the
//! extraction config's `rule_config` JSON.

use std::collections::BTreeSet;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::types::{EntityKind, ExtractedEntity, ExtractedRelation};

/// Dialogue- and honorific-based person name patterns (CJK prose).
const DEFAULT_CHARACTER_PATTERNS: &[&str] = &[
    "(?:道|说|叫|呼|唤|见|看|听)[道说]?\u{201c}([一-龯]{2,4})\u{201d}",
    "\u{201c}([一-龯]{2,4})\u{201d}(?:道|说|叫|呼|问|答)",
    "([一-龯]{2,4})(?:大师|先生|小姐|公子|少爷|姑娘)",
    "(?:师父|师兄|师姐|师弟|师妹)([一-龯]{2,4})",
];

/// Suffix-based place name patterns.
const DEFAULT_LOCATION_PATTERNS: &[&str] = &[
    "(?:来到|到了|在)([一-龯]{2,6}(?:山|峰|谷|洞|城|镇|村|府|宫|殿|楼|阁|院|房|堂))",
    "([一-龯]{2,6}(?:山|峰|谷|洞|城|镇|村|府|宫|殿|楼|阁|院|房|堂))(?:中|内|里|上|下)",
];

/// Interrogatives and demonstratives the name patterns keep matching.
const DEFAULT_FILTER_WORDS: &[&str] = &[
    "什么", "这样", "那样", "如何", "怎么", "为何", "哪里", "这里", "那里",
];

pub struct RulesExtractor {
    character_patterns: Vec<Regex>,
    location_patterns: Vec<Regex>,
    filter_words: BTreeSet<String>,
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %p, error = %e, "skipping invalid rule pattern");
                None
            }
        })
        .collect()
}

fn patterns_from_config(config: Option<&Value>, key: &str, defaults: &[&str]) -> Vec<String> {
    config
        .and_then(|c| c[key].as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| defaults.iter().map(|p| p.to_string()).collect())
}

impl RulesExtractor {
    /// Build from the extraction config's `rule_config` value; missing or
    /// empty sections fall back to the built-in patterns.
    pub fn from_config(rule_config: Option<&Value>) -> Self {
        let character = patterns_from_config(rule_config, "character_patterns", DEFAULT_CHARACTER_PATTERNS);
        let location = patterns_from_config(rule_config, "location_patterns", DEFAULT_LOCATION_PATTERNS);
        let filter = patterns_from_config(rule_config, "filter_words", DEFAULT_FILTER_WORDS);

        Self {
            character_patterns: compile_patterns(&character),
            location_patterns: compile_patterns(&location),
            filter_words: filter.into_iter().collect(),
        }
    }

    /// Extract entities from chapter content. Rules extraction produces no
    /// relations; co-occurrence is not evidence of one.
    pub fn extract(
        &self,
        content: &str,
        chapter_id: i64,
        novel_id: i64,
    ) -> (Vec<ExtractedEntity>, Vec<ExtractedRelation>) {
        let mut characters = BTreeSet::new();
        for pattern in &self.character_patterns {
            for caps in pattern.captures_iter(content) {
                if let Some(name) = caps.get(1) {
                    characters.insert(name.as_str().to_string());
                }
            }
        }
        characters.retain(|name| !self.filter_words.contains(name) && name.chars().count() >= 2);

        let mut locations = BTreeSet::new();
        for pattern in &self.location_patterns {
            for caps in pattern.captures_iter(content) {
                if let Some(name) = caps.get(1) {
                    locations.insert(name.as_str().to_string());
                }
            }
        }

        let mut entities = Vec::new();
        for name in characters {
            entities.push(ExtractedEntity {
                name,
                kind: EntityKind::Character,
                description: String::new(),
                chapter_id,
                novel_id,
            });
        }
        for name in locations {
            entities.push(ExtractedEntity {
                name,
                kind: EntityKind::Location,
                description: String::new(),
                chapter_id,
                novel_id,
            });
        }

        (entities, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialogue_speakers_become_characters() {
        let rules = RulesExtractor::from_config(None);
        let content = "\u{201c}李逍遥\u{201d}道：今日便出发。身旁的赵灵儿答道。";
        let (entities, relations) = rules.extract(content, 1, 1);
        assert!(entities
            .iter()
            .any(|e| e.name == "李逍遥" && e.kind == EntityKind::Character));
        assert!(relations.is_empty());
    }

    #[test]
    fn location_suffixes_are_detected() {
        let rules = RulesExtractor::from_config(None);
        let content = "一行人来到蜀山派驻地，又在青云城中歇脚。";
        let (entities, _) = rules.extract(content, 1, 1);
        assert!(entities
            .iter()
            .any(|e| e.kind == EntityKind::Location && e.name.contains("青云城")));
    }

    #[test]
    fn filter_words_are_dropped() {
        let rules = RulesExtractor::from_config(None);
        let content = "\u{201c}为何\u{201d}道：这是个问题。";
        let (entities, _) = rules.extract(content, 1, 1);
        assert!(!entities.iter().any(|e| e.name == "为何"));
    }

    #[test]
    fn config_overrides_replace_defaults() {
        let config = serde_json::json!({
            "character_patterns": ["said ([A-Z][a-z]+)"],
            "location_patterns": [],
            "filter_words": []
        });
        let rules = RulesExtractor::from_config(Some(&config));
        let (entities, _) = rules.extract("Then said Ana quietly.", 1, 1);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "Ana");
    }

    #[test]
    fn invalid_patterns_are_skipped_not_fatal() {
        let config = serde_json::json!({ "character_patterns": ["(["] });
        let rules = RulesExtractor::from_config(Some(&config));
        let (entities, _) = rules.extract("anything", 1, 1);
        assert!(entities.is_empty());
    }
}
