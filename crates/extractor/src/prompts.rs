//! Extraction prompt templates.
//!
//! Two prompts per chapter: one for entities, one for relations. Both ask
//! for a strict JSON payload whose shape `parse` understands. Chapter
//! content is truncated to the configured length before rendering.

use minijinja::{context, Environment};

use crate::error::ExtractError;

const ENTITY_TEMPLATE: &str = r#"Extract the characters, locations, organizations and events from the following novel chapter.

Chapter title: {{ title }}
Chapter content: {{ content }}

Respond with JSON in exactly this shape:
{
    "characters": [
        { "name": "character name", "description": "short description" }
    ],
    "locations": [
        { "name": "location name", "description": "short description" }
    ],
    "organizations": [
        { "name": "organization name", "description": "short description" }
    ],
    "events": [
        { "name": "event name", "description": "short description", "participants": ["name"] }
    ]
}

Only include entities that explicitly appear in this chapter. Respond with the JSON object and nothing else."#;

const RELATION_TEMPLATE: &str = r#"Extract character relationships and event relationships from the following novel chapter.

Chapter title: {{ title }}
Chapter content: {{ content }}

Respond with JSON in exactly this shape:
{
    "character_relationships": [
        { "from": "character A", "to": "character B", "relation": "FRIEND|ENEMY|LOVES|HATES|KNOWS|LEADS|FOLLOWS", "description": "short description" }
    ],
    "event_relationships": [
        { "character": "character name", "event": "event name", "role": "role in the event" }
    ],
    "location_relationships": [
        { "event": "event name", "location": "location name" }
    ]
}

Only include relationships made explicit in this chapter. Respond with the JSON object and nothing else."#;

const PLOT_TEMPLATE: &str = r#"Identify the plot lines advanced in the following novel chapter, together with the events and characters that drive them.

Chapter title: {{ title }}
Chapter content: {{ content }}

Respond with JSON in exactly this shape:
{
    "plots": [
        {
            "name": "plot name",
            "description": "short description of the plot line",
            "events": ["event name"],
            "characters": [
                { "name": "character name", "role": "protagonist|antagonist|supporter|witness" }
            ]
        }
    ],
    "plot_relationships": [
        { "from": "plot name", "to": "plot name", "relation": "PRECEDES|PARALLEL_TO|CONFLICTS_WITH|INCLUDES|COMPLEMENTS" }
    ]
}

Use the same event names you would extract for this chapter. Only include plot lines this chapter actually advances. Respond with the JSON object and nothing else."#;

pub struct PromptTemplates {
    env: Environment<'static>,
}

impl PromptTemplates {
    pub fn new() -> Result<Self, ExtractError> {
        let mut env = Environment::new();
        env.add_template("entities", ENTITY_TEMPLATE)?;
        env.add_template("relations", RELATION_TEMPLATE)?;
        env.add_template("plots", PLOT_TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn render_entity_prompt(&self, title: &str, content: &str) -> Result<String, ExtractError> {
        let tmpl = self.env.get_template("entities")?;
        Ok(tmpl.render(context! { title, content })?)
    }

    pub fn render_relation_prompt(&self, title: &str, content: &str) -> Result<String, ExtractError> {
        let tmpl = self.env.get_template("relations")?;
        Ok(tmpl.render(context! { title, content })?)
    }

    pub fn render_plot_prompt(&self, title: &str, content: &str) -> Result<String, ExtractError> {
        let tmpl = self.env.get_template("plots")?;
        Ok(tmpl.render(context! { title, content })?)
    }
}

/// Truncate on character boundaries, never mid-codepoint.
pub fn truncate_content(content: &str, max_chars: usize) -> String {
    content.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_prompt_substitutes_title_and_content() {
        let templates = PromptTemplates::new().unwrap();
        let prompt = templates.render_entity_prompt("Chapter One", "The duel began.").unwrap();
        assert!(prompt.contains("Chapter title: Chapter One"));
        assert!(prompt.contains("The duel began."));
        assert!(prompt.contains(r#""characters""#));
    }

    #[test]
    fn relation_prompt_lists_the_relation_vocabulary() {
        let templates = PromptTemplates::new().unwrap();
        let prompt = templates.render_relation_prompt("t", "c").unwrap();
        assert!(prompt.contains("FRIEND|ENEMY|LOVES|HATES|KNOWS|LEADS|FOLLOWS"));
        assert!(prompt.contains(r#""event_relationships""#));
    }

    #[test]
    fn plot_prompt_lists_the_plot_relation_vocabulary() {
        let templates = PromptTemplates::new().unwrap();
        let prompt = templates.render_plot_prompt("t", "c").unwrap();
        assert!(prompt.contains("PRECEDES|PARALLEL_TO|CONFLICTS_WITH|INCLUDES|COMPLEMENTS"));
        assert!(prompt.contains(r#""plots""#));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_content("许仙与白娘子", 2), "许仙");
        assert_eq!(truncate_content("abc", 10), "abc");
    }
}
