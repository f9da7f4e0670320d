//! Provider selection and queue reassignment.

use tracing::{info, warn};

use novelgraph_core::keys::{normalize_provider, RULES_PROVIDER};

use crate::entry::QueueEntry;
use crate::error::QueueError;
use crate::queues::TaskQueues;

/// Shortest-queue choice over `(provider, combined_len)` pairs; ties go to
/// the earliest candidate so rotation stays stable across calls.
pub fn choose_shortest(lengths: &[(String, usize)]) -> Option<String> {
    lengths
        .iter()
        .min_by_key(|(_, len)| *len)
        .map(|(name, _)| name.clone())
}

/// Pick the provider for a task: the active, non-suspended candidate with
/// the shortest combined queue. `rules` wins when AI is off or nothing else
/// is usable. Callers pass candidates already filtered for suspension.
pub async fn choose_provider_for_task(
    queues: &TaskQueues,
    use_ai: bool,
    candidates: &[String],
) -> Result<String, QueueError> {
    if !use_ai || candidates.is_empty() {
        return Ok(RULES_PROVIDER.to_string());
    }
    let mut lengths = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let provider = normalize_provider(candidate);
        let len = queues.combined_len(&provider).await?;
        lengths.push((provider, len));
    }
    Ok(choose_shortest(&lengths).unwrap_or_else(|| RULES_PROVIDER.to_string()))
}

/// Drain a suspended or removed provider's queues into other providers'
/// main queues. Entries are moved one at a time, so a crash mid-migration
/// leaves the remainder in the source queues for a later call to finish.
/// Returns how many entries moved.
pub async fn reassign_provider_tasks(
    queues: &TaskQueues,
    source: &str,
    candidates: &[String],
) -> Result<usize, QueueError> {
    let source = normalize_provider(source);

    // Exclude the source and the rules extractor, unless rules is all
    // that's left to keep the work flowing.
    let mut targets: Vec<String> = candidates
        .iter()
        .map(|c| normalize_provider(c))
        .filter(|c| *c != source && *c != RULES_PROVIDER)
        .collect();
    if targets.is_empty() {
        targets = candidates
            .iter()
            .map(|c| normalize_provider(c))
            .filter(|c| *c != source)
            .collect();
    }
    if targets.is_empty() {
        warn!(source = %source, "no reassignment target available, leaving queues in place");
        return Ok(0);
    }

    let mut moved = 0usize;
    loop {
        // Active batch first: those entries were about to run.
        let entry = match queues.pop_active(&source).await? {
            Some(entry) => Some(entry),
            None => queues.pop_main(&source).await?,
        };
        let Some(entry) = entry else { break };

        let mut lengths = Vec::with_capacity(targets.len());
        for target in &targets {
            lengths.push((target.clone(), queues.combined_len(target).await?));
        }
        // targets is non-empty, so a choice always exists
        let target = choose_shortest(&lengths).unwrap_or_else(|| targets[0].clone());

        let reassigned: QueueEntry = entry.reassigned_to(&target);
        queues.enqueue_to_main(reassigned.task_id, &reassigned.provider).await?;
        moved += 1;
    }

    if moved > 0 {
        info!(source = %source, moved, "reassigned queued tasks away from provider");
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortest_picks_minimum_length() {
        let lengths = vec![
            ("openai".to_string(), 4),
            ("claude".to_string(), 1),
            ("deepseek".to_string(), 9),
        ];
        assert_eq!(choose_shortest(&lengths).as_deref(), Some("claude"));
    }

    #[test]
    fn shortest_breaks_ties_by_order() {
        let lengths = vec![
            ("openai".to_string(), 2),
            ("claude".to_string(), 2),
        ];
        assert_eq!(choose_shortest(&lengths).as_deref(), Some("openai"));
    }

    #[test]
    fn shortest_of_nothing_is_none() {
        assert_eq!(choose_shortest(&[]), None);
    }
}
