//! Stable identity keys for graph nodes.
//!
//! Events and plots have no natural unique key, so their ids hash the name
//! into the scope that owns them. The same name in the same scope always
//! maps to the same node, which is what makes re-running a chapter
//! idempotent.

use sha2::{Digest, Sha256};

fn short_hash(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..8].to_string()
}

/// Event identity: scoped to (novel, chapter, name).
pub fn event_id(novel_id: i64, chapter_id: i64, name: &str) -> String {
    format!("{novel_id}_{chapter_id}_{}", short_hash(name))
}

/// Plot identity: scoped to (novel, name).
pub fn plot_id(novel_id: i64, name: &str) -> String {
    format!("plot_{novel_id}_{}", short_hash(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_is_deterministic() {
        assert_eq!(event_id(1, 2, "ambush"), event_id(1, 2, "ambush"));
    }

    #[test]
    fn event_id_scopes_by_chapter_and_novel() {
        let base = event_id(1, 2, "ambush");
        assert_ne!(base, event_id(1, 3, "ambush"));
        assert_ne!(base, event_id(2, 2, "ambush"));
        assert_ne!(base, event_id(1, 2, "duel"));
    }

    #[test]
    fn ids_embed_their_scope() {
        assert!(event_id(7, 42, "x").starts_with("7_42_"));
        assert!(plot_id(7, "x").starts_with("plot_7_"));
        assert_eq!(event_id(7, 42, "x").len(), "7_42_".len() + 8);
    }
}
