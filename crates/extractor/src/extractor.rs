//! Per-chapter extraction transaction and the task run loop.
//!
//! Ordering rule: graph upserts happen before the relational commit. A
//! crash between the two leaves the chapter row in `running`; the guard
//! loop reclassifies the task and the chapter re-runs, which is safe
//! because every graph write is an idempotent merge.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use novelgraph_core::keys::{normalize_provider, RULES_PROVIDER};
use novelgraph_core::status::{ChapterState, TaskStatus};
use novelgraph_graph::{event_id, plot_id, GraphError, GraphStore};
use novelgraph_kv::KvClient;
use novelgraph_llm::{create_provider, LlmError, LlmProvider, ProviderConfig};
use novelgraph_store::{
    Chapter, ChapterOutcome, KgTask, NovelStore, PlotStore, ProviderStore, StartOutcome,
    StartRefusal, StoreError, TaskStore,
};
use novelgraph_throttle::ProviderThrottle;

use crate::error::ExtractError;
use crate::parse::{
    entities_from_payload, parse_payload, plots_from_payload, relations_from_payload,
};
use crate::progress::publish_progress;
use crate::prompts::{truncate_content, PromptTemplates};
use crate::rules::RulesExtractor;
use crate::types::{
    dedupe_entities, dedupe_relations, EntityKind, ExtractedEntity, ExtractedRelation,
};

/// Chapters shorter than this produce no extraction call; in AI mode the
/// resulting empty output counts as an extraction failure.
const MIN_CONTENT_CHARS: usize = 10;

/// How one `run_task` invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRunOutcome {
    Completed,
    Failed,
    /// Provider suspended or admin pause; remaining chapters stay pending.
    Paused,
    /// Task cancelled or externally transitioned mid-run.
    Stopped,
    /// Another worker already holds the task; not an error.
    AlreadyRunning,
    Refused(&'static str),
    /// This worker's backlog is done but other chapters are still claimed
    /// elsewhere; the task stays running.
    LeftRunning,
}

pub struct ChapterExtractor {
    provider_name: String,
    tasks: TaskStore,
    novels: NovelStore,
    plots: PlotStore,
    graph: GraphStore,
    throttle: Arc<ProviderThrottle>,
    kv: KvClient,
    templates: PromptTemplates,
    rules: RulesExtractor,
    llm: Option<Box<dyn LlmProvider>>,
    model: Option<String>,
    max_content_length: usize,
}

impl ChapterExtractor {
    /// Build an extractor bound to one provider. For AI providers the LLM
    /// backend and model are resolved from the provider row and extraction
    /// config; a missing backend surfaces per-chapter as a config failure,
    /// never as a crash.
    pub async fn new(
        provider_name: &str,
        tasks: TaskStore,
        novels: NovelStore,
        providers: ProviderStore,
        graph: GraphStore,
        throttle: Arc<ProviderThrottle>,
        kv: KvClient,
        llm_timeout: Duration,
    ) -> Result<Self, ExtractError> {
        let provider_name = normalize_provider(provider_name);
        let config = providers.default_extraction_config().await?;
        let rules = RulesExtractor::from_config(config.rule_config.as_ref().map(|j| &j.0));

        let (llm, model) = if provider_name == RULES_PROVIDER {
            (None, None)
        } else {
            match providers.provider_by_name(&provider_name).await? {
                Some(row) => {
                    let model = row.resolve_model(config.ai_model.as_deref());
                    let provider_config = ProviderConfig {
                        name: row.name.clone(),
                        api_key: row.api_key.clone(),
                        base_url: row.base_url.clone(),
                        models: row.models.0.clone(),
                        request_timeout: llm_timeout,
                    };
                    match create_provider(&provider_config) {
                        Ok(llm) => (Some(llm), model),
                        Err(e) => {
                            warn!(provider = %provider_name, error = %e, "LLM backend unavailable");
                            (None, model)
                        }
                    }
                }
                None => {
                    warn!(provider = %provider_name, "no provider row, AI extraction disabled");
                    (None, None)
                }
            }
        };

        Ok(Self {
            provider_name,
            plots: PlotStore::new(tasks.pool().clone()),
            tasks,
            novels,
            graph,
            throttle,
            kv,
            templates: PromptTemplates::new()?,
            rules,
            llm,
            model,
            max_content_length: config.max_content_length.max(0) as usize,
        })
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    // ── task run loop ────────────────────────────────────────────────

    /// Claim and drive one task: atomically start it, then work through its
    /// pending chapters one at a time, re-checking task status and provider
    /// suspension at every chapter boundary.
    pub async fn run_task(&self, task_id: i64) -> Result<TaskRunOutcome, ExtractError> {
        match self.tasks.try_start_task(task_id).await? {
            StartOutcome::Refused(StartRefusal::AlreadyRunning) => {
                debug!(task_id, "task already running elsewhere");
                return Ok(TaskRunOutcome::AlreadyRunning);
            }
            StartOutcome::Refused(refusal) => {
                warn!(task_id, reason = refusal.reason(), "task start refused");
                return Ok(TaskRunOutcome::Refused(refusal.reason()));
            }
            StartOutcome::Started { from } => {
                info!(task_id, from = %from, provider = %self.provider_name, "task claimed");
            }
        }

        let task = self
            .tasks
            .task(task_id)
            .await?
            .ok_or(StoreError::NotFound("task", task_id))?;
        let use_ai = task.use_ai && self.provider_name != RULES_PROVIDER;

        let pending = self.tasks.pending_chapters(task_id).await?;
        if pending.is_empty() {
            return self.finalize(task_id).await;
        }

        let novel = self
            .novels
            .novel(task.novel_id)
            .await?
            .ok_or(ExtractError::NovelMissing(task.novel_id))?;
        self.graph
            .upsert_novel(novel.id, &novel.title, novel.author.as_deref())
            .await?;

        for chapter_id in pending {
            let current = self
                .tasks
                .task(task_id)
                .await?
                .ok_or(StoreError::NotFound("task", task_id))?;
            match current.status() {
                Some(TaskStatus::Running) => {}
                Some(TaskStatus::Paused) => {
                    info!(task_id, "task paused, yielding");
                    return Ok(TaskRunOutcome::Paused);
                }
                _ => {
                    info!(task_id, status = %current.status, "task no longer running, yielding");
                    return Ok(TaskRunOutcome::Stopped);
                }
            }

            if use_ai && self.throttle.is_suspended(&self.provider_name).await {
                warn!(task_id, provider = %self.provider_name, "provider suspended, pausing task");
                self.pause_quietly(task_id).await;
                return Ok(TaskRunOutcome::Paused);
            }

            match self.process_chapter(&task, chapter_id, use_ai).await {
                Ok(()) => {}
                Err(ExtractError::ProviderSuspended(provider)) => {
                    warn!(task_id, chapter_id, provider = %provider, "suspended mid-chapter, pausing task");
                    self.pause_quietly(task_id).await;
                    return Ok(TaskRunOutcome::Paused);
                }
                Err(e) => {
                    // Chapter-level errors never escape a chapter iteration.
                    error!(task_id, chapter_id, error = %e, "chapter processing error");
                    let counters = self
                        .tasks
                        .complete_chapter(
                            task_id,
                            chapter_id,
                            ChapterOutcome::Failed { error: e.to_string() },
                        )
                        .await?;
                    publish_progress(&self.kv, task_id, TaskStatus::Running.as_str(), &counters).await;
                }
            }
        }

        self.finalize(task_id).await
    }

    /// Settle the task once no pending chapters remain for this worker.
    async fn finalize(&self, task_id: i64) -> Result<TaskRunOutcome, ExtractError> {
        let counters = self.tasks.counters(task_id).await?;
        if !counters.is_settled() {
            warn!(
                task_id,
                pending = counters.pending,
                running = counters.running,
                "chapters still outstanding, leaving task running"
            );
            return Ok(TaskRunOutcome::LeftRunning);
        }

        let (status, outcome) = if counters.all_completed() {
            (TaskStatus::Completed, TaskRunOutcome::Completed)
        } else {
            (TaskStatus::Failed, TaskRunOutcome::Failed)
        };

        if let Err(e) = self.tasks.update_task_status(task_id, status, None).await {
            warn!(task_id, to = %status, error = %e, "could not settle task status");
        } else {
            info!(task_id, status = %status, completed = counters.completed, failed = counters.failed, "task settled");
        }
        publish_progress(&self.kv, task_id, status.as_str(), &counters).await;

        if outcome == TaskRunOutcome::Completed {
            self.extract_plots_if_configured(task_id).await;
        }
        Ok(outcome)
    }

    async fn pause_quietly(&self, task_id: i64) {
        if let Err(e) = self.tasks.pause_task(task_id).await {
            warn!(task_id, error = %e, "failed to pause task");
        }
        if let Ok(counters) = self.tasks.counters(task_id).await {
            publish_progress(&self.kv, task_id, TaskStatus::Paused.as_str(), &counters).await;
        }
    }

    // ── one chapter ──────────────────────────────────────────────────

    /// The extract-then-persist transaction for a single chapter.
    async fn process_chapter(
        &self,
        task: &KgTask,
        chapter_id: i64,
        use_ai: bool,
    ) -> Result<(), ExtractError> {
        let chapter = self
            .novels
            .chapter(chapter_id)
            .await?
            .ok_or(ExtractError::ChapterMissing(chapter_id))?;

        // Empty or too-short content never reaches a backend. The empty
        // result is judged below like any other: a failure in AI mode, a
        // zero-count completion in rules mode.
        let short_content = chapter.content.trim().chars().count() < MIN_CONTENT_CHARS;

        self.tasks.mark_chapter_running(task.id, chapter_id).await?;

        if let Err(e) = self
            .graph
            .upsert_chapter(chapter.id, &chapter.title, chapter.novel_id, chapter.chapter_number, task.id)
            .await
        {
            return self.fail_chapter(task.id, chapter_id, format!("graph write failed: {e}")).await;
        }

        let (entities, relations) = if short_content {
            info!(task_id = task.id, chapter_id, "content empty or too short, no extraction call");
            (Vec::new(), Vec::new())
        } else if use_ai {
            self.wait_for_permit().await;
            match self.extract_with_ai(&chapter).await {
                Ok(pair) => pair,
                Err(ExtractError::ProviderSuspended(provider)) => {
                    self.tasks.release_chapter(task.id, chapter_id).await?;
                    return Err(ExtractError::ProviderSuspended(provider));
                }
                Err(ExtractError::Llm(e)) => {
                    warn!(task_id = task.id, chapter_id, error = %e, "AI extraction failed");
                    if e.counts_as_provider_failure() {
                        let (_, suspended_now) =
                            self.throttle.increment_failure(&self.provider_name).await;
                        if suspended_now {
                            self.tasks.release_chapter(task.id, chapter_id).await?;
                            return Err(ExtractError::ProviderSuspended(self.provider_name.clone()));
                        }
                    }
                    return self.fail_chapter(task.id, chapter_id, e.to_string()).await;
                }
                Err(other) => return Err(other),
            }
        } else {
            self.rules.extract(&chapter.content, chapter.id, chapter.novel_id)
        };

        // Empty AI output counts as a provider failure. In AI mode the
        // rules extractor is never a fallback.
        if use_ai && entities.is_empty() && relations.is_empty() {
            warn!(task_id = task.id, chapter_id, "AI extraction returned nothing usable");
            self.throttle.increment_failure(&self.provider_name).await;
            return self
                .fail_chapter(task.id, chapter_id, "AI extraction returned no usable content".into())
                .await;
        }

        if use_ai {
            self.throttle.reset_failures(&self.provider_name).await;
        }

        let entities = dedupe_entities(entities);
        let relations = dedupe_relations(relations);

        match self.persist_graph(task.id, &chapter, &entities, &relations).await {
            Ok((entity_count, relation_count)) => {
                let counters = self
                    .tasks
                    .complete_chapter(
                        task.id,
                        chapter_id,
                        ChapterOutcome::Completed {
                            entities: entity_count,
                            relations: relation_count,
                        },
                    )
                    .await?;
                debug!(
                    task_id = task.id,
                    chapter_id, entity_count, relation_count, "chapter completed"
                );
                publish_progress(&self.kv, task.id, TaskStatus::Running.as_str(), &counters).await;
                Ok(())
            }
            // Partial graph writes stay: the merges are idempotent and a
            // later retry converges.
            Err(e) => self.fail_chapter(task.id, chapter_id, format!("graph write failed: {e}")).await,
        }
    }

    async fn fail_chapter(
        &self,
        task_id: i64,
        chapter_id: i64,
        error: String,
    ) -> Result<(), ExtractError> {
        let counters = self
            .tasks
            .complete_chapter(task_id, chapter_id, ChapterOutcome::Failed { error })
            .await?;
        publish_progress(&self.kv, task_id, TaskStatus::Running.as_str(), &counters).await;
        Ok(())
    }

    /// Block until the provider grants a request permit. Rate-limit waits
    /// are not failures.
    async fn wait_for_permit(&self) {
        loop {
            let decision = self.throttle.try_acquire_permit(&self.provider_name).await;
            if decision.granted {
                return;
            }
            debug!(
                provider = %self.provider_name,
                wait = decision.wait_seconds,
                "rate limited, sleeping"
            );
            tokio::time::sleep(Duration::from_secs_f64(decision.wait_seconds.min(60.0))).await;
        }
    }

    /// Two generations per chapter: entities, then relations.
    async fn extract_with_ai(
        &self,
        chapter: &Chapter,
    ) -> Result<(Vec<ExtractedEntity>, Vec<ExtractedRelation>), ExtractError> {
        if self.throttle.is_suspended(&self.provider_name).await {
            return Err(ExtractError::ProviderSuspended(self.provider_name.clone()));
        }
        let llm = self.llm.as_ref().ok_or_else(|| {
            LlmError::NotConfigured(format!("provider '{}' has no usable backend", self.provider_name))
        })?;
        let model = self.model.clone().ok_or_else(|| {
            LlmError::NotConfigured(format!("provider '{}' has no model", self.provider_name))
        })?;

        let content = truncate_content(&chapter.content, self.max_content_length);

        let entity_prompt = self.templates.render_entity_prompt(&chapter.title, &content)?;
        let entity_completion = llm.generate(&entity_prompt, &model).await.map_err(ExtractError::Llm)?;
        let entities = parse_payload(&entity_completion.text)
            .map(|p| entities_from_payload(&p, chapter.id, chapter.novel_id))
            .unwrap_or_default();

        let relation_prompt = self.templates.render_relation_prompt(&chapter.title, &content)?;
        let relation_completion =
            llm.generate(&relation_prompt, &model).await.map_err(ExtractError::Llm)?;
        let relations = parse_payload(&relation_completion.text)
            .map(|p| relations_from_payload(&p, chapter.id, chapter.novel_id))
            .unwrap_or_default();

        debug!(
            chapter_id = chapter.id,
            entities = entities.len(),
            relations = relations.len(),
            in_tokens = entity_completion.input_tokens + relation_completion.input_tokens,
            out_tokens = entity_completion.output_tokens + relation_completion.output_tokens,
            "AI extraction done"
        );
        Ok((entities, relations))
    }

    // ── graph persistence ────────────────────────────────────────────

    /// Upsert every entity and relation. The first graph failure aborts and
    /// surfaces as the chapter's error; already-written nodes stay.
    async fn persist_graph(
        &self,
        task_id: i64,
        chapter: &Chapter,
        entities: &[ExtractedEntity],
        relations: &[ExtractedRelation],
    ) -> Result<(i64, i64), ExtractError> {
        let mut entity_count = 0i64;
        for entity in entities {
            match entity.kind {
                EntityKind::Character => {
                    self.graph
                        .upsert_character(&entity.name, entity.novel_id, task_id, &entity.description)
                        .await?;
                    self.graph
                        .character_appears_in_chapter(&entity.name, entity.novel_id, chapter.id)
                        .await?;
                }
                EntityKind::Location => {
                    self.graph
                        .upsert_location(&entity.name, entity.novel_id, task_id, &entity.description)
                        .await?;
                }
                EntityKind::Organization => {
                    self.graph
                        .upsert_organization(&entity.name, entity.novel_id, task_id, &entity.description)
                        .await?;
                }
                EntityKind::Event => {
                    let id = event_id(entity.novel_id, entity.chapter_id, &entity.name);
                    self.graph
                        .upsert_event(
                            &id,
                            &entity.name,
                            entity.chapter_id,
                            chapter.chapter_number,
                            entity.novel_id,
                            task_id,
                            &entity.description,
                        )
                        .await?;
                }
            }
            entity_count += 1;
        }

        let mut relation_count = 0i64;
        for relation in relations {
            match relation.relation.as_str() {
                "PARTICIPATES_IN" => {
                    let id = event_id(relation.novel_id, relation.chapter_id, &relation.to);
                    self.graph
                        .character_participates_in_event(
                            &relation.from,
                            relation.novel_id,
                            &id,
                            &relation.description,
                        )
                        .await?;
                }
                "OCCURS_IN" => {
                    let id = event_id(relation.novel_id, relation.chapter_id, &relation.from);
                    self.graph
                        .event_occurs_in_location(&id, &relation.to, relation.novel_id)
                        .await?;
                }
                "BELONGS_TO" => {
                    self.graph
                        .character_belongs_to_organization(
                            &relation.from,
                            &relation.to,
                            relation.novel_id,
                            &relation.description,
                        )
                        .await?;
                }
                kind if novelgraph_graph::store::CHARACTER_RELATIONS.contains(&kind) => {
                    self.graph
                        .character_relationship(
                            &relation.from,
                            &relation.to,
                            kind,
                            relation.novel_id,
                            &relation.description,
                        )
                        .await?;
                }
                other => {
                    debug!(relation = other, "dropping relation of unknown type");
                    continue;
                }
            }
            relation_count += 1;
        }

        Ok((entity_count, relation_count))
    }

    // ── plot extraction ──────────────────────────────────────────────

    /// Derived plot pass once a task finishes with every chapter succeeded.
    /// Failures here never touch the settled task; they are recorded on
    /// the plot run and its logs.
    async fn extract_plots_if_configured(&self, task_id: i64) {
        let task = match self.tasks.task(task_id).await {
            Ok(Some(task)) => task,
            _ => return,
        };
        if !task.use_ai || self.llm.is_none() {
            return;
        }
        if let Err(e) = self.extract_plots_for_task(&task).await {
            warn!(task_id, error = %e, "plot extraction failed");
        }
    }

    /// Run one plot-extraction pass over the task's completed chapters:
    /// one generation per chapter, merged into Plot nodes keyed by
    /// (novel, name) so recurring plot lines accumulate across chapters.
    async fn extract_plots_for_task(&self, task: &KgTask) -> Result<(), ExtractError> {
        let Some(plot_task_id) = self.plots.begin_for_task(task.id).await? else {
            debug!(task_id = task.id, "plot extraction already ran for this task");
            return Ok(());
        };

        let rows = self.tasks.chapter_rows(task.id).await?;
        let mut total_plots = 0usize;
        for row in rows {
            if row.state() != Some(ChapterState::Completed) {
                continue;
            }
            let Some(chapter) = self.novels.chapter(row.chapter_id).await? else { continue };
            if chapter.content.trim().chars().count() < MIN_CONTENT_CHARS {
                continue;
            }

            if self.throttle.is_suspended(&self.provider_name).await {
                self.plots
                    .log(plot_task_id, &format!("provider '{}' suspended, run aborted", self.provider_name))
                    .await?;
                self.plots.finish(plot_task_id, "failed").await?;
                return Ok(());
            }

            self.wait_for_permit().await;
            match self.extract_chapter_plots(task, &chapter).await {
                Ok(count) => {
                    total_plots += count;
                    self.plots
                        .log(plot_task_id, &format!("chapter {}: {} plot lines", chapter.id, count))
                        .await?;
                }
                Err(ExtractError::Llm(e)) => {
                    if e.counts_as_provider_failure() {
                        self.throttle.increment_failure(&self.provider_name).await;
                    }
                    self.plots
                        .log(plot_task_id, &format!("chapter {}: {}", chapter.id, e))
                        .await?;
                    self.plots.finish(plot_task_id, "failed").await?;
                    return Ok(());
                }
                Err(e) => {
                    self.plots.log(plot_task_id, &e.to_string()).await?;
                    self.plots.finish(plot_task_id, "failed").await?;
                    return Err(e);
                }
            }
        }

        self.plots.finish(plot_task_id, "completed").await?;
        info!(task_id = task.id, plots = total_plots, "plot extraction completed");
        Ok(())
    }

    async fn extract_chapter_plots(
        &self,
        task: &KgTask,
        chapter: &Chapter,
    ) -> Result<usize, ExtractError> {
        let llm = self.llm.as_ref().ok_or_else(|| {
            LlmError::NotConfigured(format!("provider '{}' has no usable backend", self.provider_name))
        })?;
        let model = self.model.clone().ok_or_else(|| {
            LlmError::NotConfigured(format!("provider '{}' has no model", self.provider_name))
        })?;

        let content = truncate_content(&chapter.content, self.max_content_length);
        let prompt = self.templates.render_plot_prompt(&chapter.title, &content)?;
        let completion = llm.generate(&prompt, &model).await.map_err(ExtractError::Llm)?;
        let Some(payload) = parse_payload(&completion.text) else {
            debug!(chapter_id = chapter.id, "plot payload not parseable, nothing recorded");
            return Ok(0);
        };
        let (plots, relations) = plots_from_payload(&payload);

        for plot in &plots {
            let pid = plot_id(chapter.novel_id, &plot.name);
            self.graph
                .upsert_plot(&pid, &plot.name, chapter.novel_id, task.id, &plot.description)
                .await?;
            self.graph.plot_happens_in_chapter(&pid, chapter.id).await?;
            for event in &plot.events {
                // No-op unless the entity pass created this event node.
                let eid = event_id(chapter.novel_id, chapter.id, event);
                self.graph.event_part_of_plot(&eid, &pid).await?;
            }
            for participant in &plot.characters {
                self.graph
                    .character_participates_in_plot(
                        &participant.name,
                        chapter.novel_id,
                        &pid,
                        &participant.role,
                    )
                    .await?;
            }
        }

        for relation in &relations {
            let from = plot_id(chapter.novel_id, &relation.from);
            let to = plot_id(chapter.novel_id, &relation.to);
            match self.graph.plot_relationship(&from, &to, &relation.relation).await {
                Ok(()) => {}
                Err(GraphError::UnsupportedRelation(r)) => {
                    debug!(relation = %r, "dropping plot relation of unknown type");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(plots.len())
    }

    // ── admin: restart ───────────────────────────────────────────────

    /// Full restart: remove this task's graph footprint (multiset rule),
    /// then reset the relational rows back to `created`/`pending`.
    pub async fn restart_task(&self, task_id: i64) -> Result<(), ExtractError> {
        self.graph.delete_task_nodes(task_id).await?;
        self.tasks.restart_task_rows(task_id).await?;
        Ok(())
    }
}
