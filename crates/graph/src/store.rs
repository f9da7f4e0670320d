//! Neo4j adapter.
//!
//! Every write is a `MERGE` keyed on stable identity, so re-running a
//! chapter (after a crash, a retry, or a restart) converges instead of
//! duplicating. Nodes carry a `task_id` list treated as an append-only
//! multiset; restart removes one task's id and deletes the node only when
//! the list empties.

use neo4rs::{query, Graph};
use tracing::{debug, info, warn};

use novelgraph_core::config::Neo4jConfig;

use crate::error::GraphError;

/// Character-to-character relations the pipeline is allowed to materialize.
pub const CHARACTER_RELATIONS: &[&str] =
    &["FRIEND", "ENEMY", "LOVES", "HATES", "KNOWS", "LEADS", "FOLLOWS"];

/// Plot-to-plot relations.
pub const PLOT_RELATIONS: &[&str] =
    &["PRECEDES", "PARALLEL_TO", "CONFLICTS_WITH", "INCLUDES", "COMPLEMENTS"];

/// Cypher fragment appending `$task_id` to a node's task-id multiset.
/// Relation types are interpolated into Cypher (parameters cannot name a
/// type), so they must pass the whitelist above first.
fn task_id_clause(alias: &str) -> String {
    format!(
        "SET {a}.task_id = CASE WHEN {a}.task_id IS NULL THEN [$task_id]
                                WHEN NOT $task_id IN {a}.task_id THEN {a}.task_id + [$task_id]
                                ELSE {a}.task_id END",
        a = alias
    )
}

#[derive(Clone)]
pub struct GraphStore {
    graph: Graph,
}

impl GraphStore {
    pub async fn connect(config: &Neo4jConfig) -> Result<Self, GraphError> {
        let graph = Graph::new(&config.uri, &config.user, &config.password).await?;
        info!(uri = %config.uri, "neo4j connected");
        Ok(Self { graph })
    }

    /// Create lookup indexes for the merge keys. Safe to call repeatedly.
    pub async fn ensure_indexes(&self) -> Result<(), GraphError> {
        let statements = [
            "CREATE INDEX character_identity IF NOT EXISTS FOR (c:Character) ON (c.name, c.novel_id)",
            "CREATE INDEX location_identity IF NOT EXISTS FOR (l:Location) ON (l.name, l.novel_id)",
            "CREATE INDEX organization_identity IF NOT EXISTS FOR (o:Organization) ON (o.name, o.novel_id)",
            "CREATE INDEX event_identity IF NOT EXISTS FOR (e:Event) ON (e.id)",
            "CREATE INDEX chapter_identity IF NOT EXISTS FOR (ch:Chapter) ON (ch.id)",
            "CREATE INDEX novel_identity IF NOT EXISTS FOR (n:Novel) ON (n.id)",
            "CREATE INDEX plot_identity IF NOT EXISTS FOR (p:Plot) ON (p.id)",
        ];
        for stmt in statements {
            self.graph.run(query(stmt)).await?;
        }
        Ok(())
    }

    pub async fn test_connection(&self) -> Result<(), GraphError> {
        let mut rows = self.graph.execute(query("RETURN 1 AS probe")).await?;
        rows.next().await?;
        Ok(())
    }

    /// Retry a write once on transient connection loss. Merges are
    /// idempotent, so a duplicate attempt cannot corrupt the graph.
    async fn run_with_retry(&self, q: neo4rs::Query) -> Result<(), GraphError> {
        match self.graph.run(q.clone()).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "graph write failed, retrying once");
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                self.graph.run(q).await.map_err(GraphError::from)
            }
        }
    }

    // ── node upserts ─────────────────────────────────────────────────

    pub async fn upsert_novel(
        &self,
        novel_id: i64,
        title: &str,
        author: Option<&str>,
    ) -> Result<(), GraphError> {
        let q = query(
            "MERGE (n:Novel {id: $novel_id})
             SET n.title = $title,
                 n.author = $author,
                 n.created_at = coalesce(n.created_at, datetime()),
                 n.updated_at = datetime()",
        )
        .param("novel_id", novel_id)
        .param("title", title)
        .param("author", author.unwrap_or_default());
        self.run_with_retry(q).await
    }

    pub async fn upsert_chapter(
        &self,
        chapter_id: i64,
        title: &str,
        novel_id: i64,
        chapter_number: i64,
        task_id: i64,
    ) -> Result<(), GraphError> {
        let cypher = format!(
            "MERGE (ch:Chapter {{id: $chapter_id}})
             SET ch.title = $title,
                 ch.novel_id = $novel_id,
                 ch.chapter_number = $chapter_number,
                 ch.created_at = coalesce(ch.created_at, datetime()),
                 ch.updated_at = datetime()
             {}",
            task_id_clause("ch")
        );
        let q = query(&cypher)
            .param("chapter_id", chapter_id)
            .param("title", title)
            .param("novel_id", novel_id)
            .param("chapter_number", chapter_number)
            .param("task_id", task_id);
        self.run_with_retry(q).await
    }

    /// Character/Location/Organization share the (name, novel_id) identity.
    async fn upsert_named_entity(
        &self,
        label: &str,
        name: &str,
        novel_id: i64,
        task_id: i64,
        description: &str,
    ) -> Result<(), GraphError> {
        let cypher = format!(
            "MERGE (n:{label} {{name: $name, novel_id: $novel_id}})
             SET n.description = CASE WHEN $description <> '' THEN $description ELSE n.description END,
                 n.created_at = coalesce(n.created_at, datetime()),
                 n.updated_at = datetime()
             {}",
            task_id_clause("n")
        );
        let q = query(&cypher)
            .param("name", name)
            .param("novel_id", novel_id)
            .param("description", description)
            .param("task_id", task_id);
        debug!(label, name, novel_id, "merge entity node");
        self.run_with_retry(q).await
    }

    pub async fn upsert_character(
        &self,
        name: &str,
        novel_id: i64,
        task_id: i64,
        description: &str,
    ) -> Result<(), GraphError> {
        self.upsert_named_entity("Character", name, novel_id, task_id, description).await
    }

    pub async fn upsert_location(
        &self,
        name: &str,
        novel_id: i64,
        task_id: i64,
        description: &str,
    ) -> Result<(), GraphError> {
        self.upsert_named_entity("Location", name, novel_id, task_id, description).await
    }

    pub async fn upsert_organization(
        &self,
        name: &str,
        novel_id: i64,
        task_id: i64,
        description: &str,
    ) -> Result<(), GraphError> {
        self.upsert_named_entity("Organization", name, novel_id, task_id, description).await
    }

    pub async fn upsert_event(
        &self,
        event_id: &str,
        name: &str,
        chapter_id: i64,
        chapter_number: i64,
        novel_id: i64,
        task_id: i64,
        description: &str,
    ) -> Result<(), GraphError> {
        let cypher = format!(
            "MERGE (e:Event {{id: $event_id}})
             SET e.name = $name,
                 e.chapter_id = $chapter_id,
                 e.chapter_number = $chapter_number,
                 e.novel_id = $novel_id,
                 e.description = CASE WHEN $description <> '' THEN $description ELSE e.description END,
                 e.created_at = coalesce(e.created_at, datetime()),
                 e.updated_at = datetime()
             {}",
            task_id_clause("e")
        );
        let q = query(&cypher)
            .param("event_id", event_id)
            .param("name", name)
            .param("chapter_id", chapter_id)
            .param("chapter_number", chapter_number)
            .param("novel_id", novel_id)
            .param("description", description)
            .param("task_id", task_id);
        self.run_with_retry(q).await
    }

    pub async fn upsert_plot(
        &self,
        plot_id: &str,
        name: &str,
        novel_id: i64,
        task_id: i64,
        description: &str,
    ) -> Result<(), GraphError> {
        let cypher = format!(
            "MERGE (p:Plot {{id: $plot_id}})
             SET p.name = $name,
                 p.novel_id = $novel_id,
                 p.description = CASE WHEN $description <> '' THEN $description ELSE p.description END,
                 p.created_at = coalesce(p.created_at, datetime()),
                 p.updated_at = datetime()
             {}",
            task_id_clause("p")
        );
        let q = query(&cypher)
            .param("plot_id", plot_id)
            .param("name", name)
            .param("novel_id", novel_id)
            .param("description", description)
            .param("task_id", task_id);
        self.run_with_retry(q).await
    }

    // ── edge upserts ─────────────────────────────────────────────────

    pub async fn character_appears_in_chapter(
        &self,
        character: &str,
        novel_id: i64,
        chapter_id: i64,
    ) -> Result<(), GraphError> {
        let q = query(
            "MATCH (c:Character {name: $character, novel_id: $novel_id})
             MATCH (ch:Chapter {id: $chapter_id})
             MERGE (c)-[r:APPEARS_IN]->(ch)
             SET r.novel_id = $novel_id,
                 r.created_at = coalesce(r.created_at, datetime())",
        )
        .param("character", character)
        .param("novel_id", novel_id)
        .param("chapter_id", chapter_id);
        self.run_with_retry(q).await
    }

    pub async fn character_participates_in_event(
        &self,
        character: &str,
        novel_id: i64,
        event_id: &str,
        role: &str,
    ) -> Result<(), GraphError> {
        let q = query(
            "MATCH (c:Character {name: $character, novel_id: $novel_id})
             MATCH (e:Event {id: $event_id})
             MERGE (c)-[r:PARTICIPATES_IN]->(e)
             SET r.role = CASE WHEN $role <> '' THEN $role ELSE r.role END,
                 r.novel_id = $novel_id,
                 r.created_at = coalesce(r.created_at, datetime())",
        )
        .param("character", character)
        .param("novel_id", novel_id)
        .param("event_id", event_id)
        .param("role", role);
        self.run_with_retry(q).await
    }

    pub async fn event_occurs_in_location(
        &self,
        event_id: &str,
        location: &str,
        novel_id: i64,
    ) -> Result<(), GraphError> {
        let q = query(
            "MATCH (e:Event {id: $event_id})
             MATCH (l:Location {name: $location, novel_id: $novel_id})
             MERGE (e)-[r:OCCURS_IN]->(l)
             SET r.novel_id = $novel_id,
                 r.created_at = coalesce(r.created_at, datetime())",
        )
        .param("event_id", event_id)
        .param("location", location)
        .param("novel_id", novel_id);
        self.run_with_retry(q).await
    }

    pub async fn character_belongs_to_organization(
        &self,
        character: &str,
        organization: &str,
        novel_id: i64,
        position: &str,
    ) -> Result<(), GraphError> {
        let q = query(
            "MATCH (c:Character {name: $character, novel_id: $novel_id})
             MATCH (o:Organization {name: $organization, novel_id: $novel_id})
             MERGE (c)-[r:BELONGS_TO]->(o)
             SET r.position = CASE WHEN $position <> '' THEN $position ELSE r.position END,
                 r.novel_id = $novel_id,
                 r.created_at = coalesce(r.created_at, datetime())",
        )
        .param("character", character)
        .param("organization", organization)
        .param("novel_id", novel_id)
        .param("position", position);
        self.run_with_retry(q).await
    }

    pub async fn character_relationship(
        &self,
        from: &str,
        to: &str,
        relation: &str,
        novel_id: i64,
        description: &str,
    ) -> Result<(), GraphError> {
        if !CHARACTER_RELATIONS.contains(&relation) {
            return Err(GraphError::UnsupportedRelation(relation.to_string()));
        }
        let cypher = format!(
            "MATCH (a:Character {{name: $from, novel_id: $novel_id}})
             MATCH (b:Character {{name: $to, novel_id: $novel_id}})
             MERGE (a)-[r:{relation}]->(b)
             SET r.description = CASE WHEN $description <> '' THEN $description ELSE r.description END,
                 r.novel_id = $novel_id,
                 r.created_at = coalesce(r.created_at, datetime())"
        );
        let q = query(&cypher)
            .param("from", from)
            .param("to", to)
            .param("novel_id", novel_id)
            .param("description", description);
        self.run_with_retry(q).await
    }

    pub async fn event_part_of_plot(&self, event_id: &str, plot_id: &str) -> Result<(), GraphError> {
        let q = query(
            "MATCH (e:Event {id: $event_id})
             MATCH (p:Plot {id: $plot_id})
             MERGE (e)-[r:PART_OF]->(p)
             SET r.created_at = coalesce(r.created_at, datetime())",
        )
        .param("event_id", event_id)
        .param("plot_id", plot_id);
        self.run_with_retry(q).await
    }

    pub async fn plot_happens_in_chapter(
        &self,
        plot_id: &str,
        chapter_id: i64,
    ) -> Result<(), GraphError> {
        let q = query(
            "MATCH (p:Plot {id: $plot_id})
             MATCH (ch:Chapter {id: $chapter_id})
             MERGE (p)-[r:HAPPENS_IN]->(ch)
             SET r.created_at = coalesce(r.created_at, datetime())",
        )
        .param("plot_id", plot_id)
        .param("chapter_id", chapter_id);
        self.run_with_retry(q).await
    }

    pub async fn character_participates_in_plot(
        &self,
        character: &str,
        novel_id: i64,
        plot_id: &str,
        role: &str,
    ) -> Result<(), GraphError> {
        let q = query(
            "MATCH (c:Character {name: $character, novel_id: $novel_id})
             MATCH (p:Plot {id: $plot_id})
             MERGE (c)-[r:PARTICIPATES_IN]->(p)
             SET r.role = CASE WHEN $role <> '' THEN $role ELSE r.role END,
                 r.novel_id = $novel_id,
                 r.created_at = coalesce(r.created_at, datetime())",
        )
        .param("character", character)
        .param("novel_id", novel_id)
        .param("plot_id", plot_id)
        .param("role", role);
        self.run_with_retry(q).await
    }

    pub async fn plot_relationship(
        &self,
        from_plot: &str,
        to_plot: &str,
        relation: &str,
    ) -> Result<(), GraphError> {
        if !PLOT_RELATIONS.contains(&relation) {
            return Err(GraphError::UnsupportedRelation(relation.to_string()));
        }
        let cypher = format!(
            "MATCH (a:Plot {{id: $from_plot}})
             MATCH (b:Plot {{id: $to_plot}})
             MERGE (a)-[r:{relation}]->(b)
             SET r.created_at = coalesce(r.created_at, datetime())"
        );
        let q = query(&cypher).param("from_plot", from_plot).param("to_plot", to_plot);
        self.run_with_retry(q).await
    }

    // ── deletion ─────────────────────────────────────────────────────

    /// Remove one task from every node's task-id multiset; nodes owned by
    /// no other task are detached and deleted. Returns the deleted count.
    pub async fn delete_task_nodes(&self, task_id: i64) -> Result<u64, GraphError> {
        let q = query(
            "MATCH (n)
             WHERE $task_id IN n.task_id
             WITH n, n.task_id AS task_ids
             SET n.task_id = [tid IN task_ids WHERE tid <> $task_id]
             WITH n
             WHERE size(n.task_id) = 0
             DETACH DELETE n
             RETURN count(n) AS deleted",
        )
        .param("task_id", task_id);

        let mut rows = self.graph.execute(q).await?;
        let deleted = match rows.next().await? {
            Some(row) => row.get::<i64>("deleted").unwrap_or(0) as u64,
            None => 0,
        };
        info!(task_id, deleted, "removed task's graph nodes");
        Ok(deleted)
    }

    /// Delete the whole subtree of a novel (cascade path of novel deletion).
    pub async fn delete_novel_graph(&self, novel_id: i64) -> Result<(), GraphError> {
        let q = query("MATCH (n {novel_id: $novel_id}) DETACH DELETE n").param("novel_id", novel_id);
        self.graph.run(q).await?;
        let q = query("MATCH (n:Novel {id: $novel_id}) DETACH DELETE n").param("novel_id", novel_id);
        self.graph.run(q).await?;
        info!(novel_id, "deleted novel graph subtree");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_clause_appends_only_when_absent() {
        let clause = task_id_clause("n");
        assert!(clause.contains("WHEN n.task_id IS NULL THEN [$task_id]"));
        assert!(clause.contains("WHEN NOT $task_id IN n.task_id THEN n.task_id + [$task_id]"));
        assert!(clause.contains("ELSE n.task_id END"));
    }

    #[test]
    fn relation_whitelists_cover_the_schema() {
        for r in ["FRIEND", "ENEMY", "LOVES", "HATES", "KNOWS", "LEADS", "FOLLOWS"] {
            assert!(CHARACTER_RELATIONS.contains(&r));
        }
        for r in ["PRECEDES", "PARALLEL_TO", "CONFLICTS_WITH", "INCLUDES", "COMPLEMENTS"] {
            assert!(PLOT_RELATIONS.contains(&r));
        }
        assert!(!CHARACTER_RELATIONS.contains(&"DROP DATABASE"));
    }
}
