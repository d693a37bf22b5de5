//! Task batching.
//!
//! Before synchronous dispatch, queued tasks headed for the same agent are
//! grouped into batches by pairwise similarity. Only high-priority tasks
//! may form a batch of one; the rest are batched only when grouped.

use crate::core::scheduler::priority::effective_priority;
use crate::infrastructure::persistence::QueueDocument;
use crate::tasks::compression;
use crate::tasks::similarity::word_jaccard;
use crate::tasks::task::{Batch, BatchStatus, Task, TaskStatus};
use crate::utils::config::BatchingConfig;
use std::collections::HashMap;
use tracing::debug;

/// Pairwise similarity of two tasks:
/// 0.4 type match + 0.4 description Jaccard + 0.2 priority closeness.
#[must_use]
pub fn task_similarity(a: &Task, b: &Task) -> f64 {
    let type_term = if a.task_type == b.task_type { 1.0 } else { 0.0 };

    let desc_a = compression::decompress(&a.description).unwrap_or_else(|_| a.description.clone());
    let desc_b = compression::decompress(&b.description).unwrap_or_else(|_| b.description.clone());
    let desc_term = word_jaccard(&desc_a, &desc_b);

    let priority_term = 1.0 - f64::from(a.priority.abs_diff(b.priority)) / 9.0;

    0.4 * type_term + 0.4 * desc_term + 0.2 * priority_term
}

/// Group queued, unbatched tasks into new batches.
///
/// `assignments` maps task id to the agent chosen for it; tasks without an
/// assignment are skipped. Member tasks get their `batch_id` set and the
/// new batches are appended as `active`. Returns the created batch ids.
pub fn create_batches(
    doc: &mut QueueDocument,
    assignments: &HashMap<String, String>,
    config: &BatchingConfig,
    now: i64,
) -> Vec<String> {
    // group candidate task ids per agent, highest effective priority first
    let mut per_agent: HashMap<String, Vec<String>> = HashMap::new();
    let mut candidates: Vec<&Task> = doc
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Queued && t.batch_id.is_none())
        .filter(|t| assignments.contains_key(&t.id))
        .collect();
    candidates.sort_by(|a, b| {
        effective_priority(b, now)
            .cmp(&effective_priority(a, now))
            .then(a.created.cmp(&b.created))
    });
    for task in candidates {
        if let Some(agent) = assignments.get(&task.id) {
            per_agent.entry(agent.clone()).or_default().push(task.id.clone());
        }
    }

    let mut created = Vec::new();

    for (agent, task_ids) in per_agent {
        let open_batches = doc
            .batches
            .iter()
            .filter(|b| {
                b.agent == agent && matches!(b.status, BatchStatus::Active | BatchStatus::Assigned)
            })
            .count();
        let mut slots = config.max_active_batches.saturating_sub(open_batches);
        if slots == 0 {
            continue;
        }

        let mut remaining = task_ids;
        while !remaining.is_empty() && slots > 0 {
            let seed_id = remaining.remove(0);
            let mut members = vec![seed_id.clone()];

            // greedy clustering against the seed
            remaining.retain(|candidate_id| {
                if members.len() >= config.max_batch_size {
                    return true;
                }
                let (Some(seed), Some(candidate)) =
                    (doc.find_task(&seed_id), doc.find_task(candidate_id))
                else {
                    return true;
                };
                if task_similarity(seed, candidate) >= config.similarity_threshold {
                    members.push(candidate_id.clone());
                    false
                } else {
                    true
                }
            });

            let seed_priority = doc
                .find_task(&seed_id)
                .map(|t| effective_priority(t, now))
                .unwrap_or(1);

            // singletons only batch when high priority
            if members.len() == 1 && seed_priority < 8 {
                continue;
            }

            let batch_priority = members
                .iter()
                .filter_map(|id| doc.find_task(id))
                .map(|t| effective_priority(t, now))
                .max()
                .unwrap_or(seed_priority);

            let batch = Batch::new(agent.clone(), members.clone(), batch_priority, now);
            for member_id in &members {
                if let Some(task) = doc.find_task_mut(member_id) {
                    task.batch_id = Some(batch.id.clone());
                }
            }
            debug!(
                batch_id = %batch.id,
                agent = %agent,
                size = members.len(),
                priority = batch_priority,
                "batch created"
            );
            created.push(batch.id.clone());
            doc.batches.push(batch);
            slots -= 1;
        }
    }

    created
}

/// Mark batches whose members all reached a terminal state, and drop
/// completed batches with no surviving member references. Returns the ids
/// of batches closed this pass.
pub fn cleanup_batches(doc: &mut QueueDocument, now: i64) -> Vec<String> {
    let mut closed = Vec::new();

    let live_ids: std::collections::HashSet<String> =
        doc.tasks.iter().map(|t| t.id.clone()).collect();

    for batch in &mut doc.batches {
        if batch.status == BatchStatus::Completed {
            continue;
        }
        let all_terminal = batch.task_ids.iter().all(|id| !live_ids.contains(id));
        if all_terminal {
            batch.status = BatchStatus::Completed;
            batch.completed_at = Some(now);
            closed.push(batch.id.clone());
        }
    }

    // keep recently completed batches for reporting, drop the stale rest
    const COMPLETED_BATCH_TTL: i64 = 3600;
    doc.batches.retain(|b| {
        b.status != BatchStatus::Completed
            || b.completed_at.map_or(true, |t| now - t < COMPLETED_BATCH_TTL)
    });

    closed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_task(id: &str, task_type: &str, description: &str, priority: u8) -> Task {
        Task::new(
            id.to_string(),
            task_type.to_string(),
            description.to_string(),
            priority,
            1_000,
        )
    }

    fn assignments(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(t, a)| ((*t).to_string(), (*a).to_string()))
            .collect()
    }

    #[test]
    fn similar_tasks_form_one_batch() {
        let mut doc = QueueDocument::default();
        doc.tasks.push(queued_task(
            "task_1000_1",
            "test",
            "run unit tests for parser",
            5,
        ));
        doc.tasks.push(queued_task(
            "task_1000_2",
            "test",
            "run unit tests for lexer",
            5,
        ));

        let created = create_batches(
            &mut doc,
            &assignments(&[("task_1000_1", "agent_test"), ("task_1000_2", "agent_test")]),
            &BatchingConfig::default(),
            1_000,
        );
        assert_eq!(created.len(), 1);
        let batch = doc.find_batch(&created[0]).unwrap();
        assert_eq!(batch.task_ids.len(), 2);
        assert_eq!(batch.agent, "agent_test");
        // all member tasks carry the batch id
        for id in &batch.task_ids {
            assert_eq!(
                doc.find_task(id).unwrap().batch_id.as_deref(),
                Some(batch.id.as_str())
            );
        }
    }

    #[test]
    fn low_priority_singleton_stays_unbatched() {
        let mut doc = QueueDocument::default();
        doc.tasks
            .push(queued_task("task_1000_1", "docs", "write changelog", 4));

        let created = create_batches(
            &mut doc,
            &assignments(&[("task_1000_1", "agent_docs")]),
            &BatchingConfig::default(),
            1_000,
        );
        assert!(created.is_empty());
        assert!(doc.find_task("task_1000_1").unwrap().batch_id.is_none());
    }

    #[test]
    fn high_priority_singleton_forms_batch_of_one() {
        let mut doc = QueueDocument::default();
        doc.tasks.push(queued_task(
            "task_1000_1",
            "security",
            "audit dependency tree",
            8,
        ));

        let created = create_batches(
            &mut doc,
            &assignments(&[("task_1000_1", "agent_sec")]),
            &BatchingConfig::default(),
            1_000,
        );
        assert_eq!(created.len(), 1);
        assert_eq!(doc.find_batch(&created[0]).unwrap().task_ids.len(), 1);
    }

    #[test]
    fn batch_size_is_capped() {
        let mut doc = QueueDocument::default();
        let mut pairs = Vec::new();
        let ids: Vec<String> = (0..8).map(|i| format!("task_1000_{i}")).collect();
        for id in &ids {
            doc.tasks
                .push(queued_task(id, "test", "run unit tests for module", 5));
        }
        for id in &ids {
            pairs.push((id.as_str(), "agent_test"));
        }

        let config = BatchingConfig {
            max_batch_size: 3,
            ..BatchingConfig::default()
        };
        let created = create_batches(&mut doc, &assignments(&pairs), &config, 1_000);
        assert!(!created.is_empty());
        for id in &created {
            assert!(doc.find_batch(id).unwrap().task_ids.len() <= 3);
        }
    }

    #[test]
    fn active_batches_per_agent_are_capped() {
        let mut doc = QueueDocument::default();
        for i in 0..3 {
            doc.batches.push(Batch::new(
                "agent_test".to_string(),
                vec![format!("task_900_{i}")],
                5,
                900,
            ));
        }
        doc.tasks
            .push(queued_task("task_1000_1", "security", "audit tree", 9));

        let created = create_batches(
            &mut doc,
            &assignments(&[("task_1000_1", "agent_test")]),
            &BatchingConfig::default(),
            1_000,
        );
        assert!(created.is_empty());
    }

    #[test]
    fn cleanup_marks_finished_batches() {
        let mut doc = QueueDocument::default();
        let mut batch = Batch::new(
            "agent_test".to_string(),
            vec!["task_900_1".to_string()],
            5,
            900,
        );
        batch.status = BatchStatus::Assigned;
        doc.batches.push(batch);
        // the member task already moved to completed history

        let closed = cleanup_batches(&mut doc, 1_000);
        assert_eq!(closed.len(), 1);
        assert_eq!(doc.batches[0].status, BatchStatus::Completed);
    }

    #[test]
    fn dissimilar_types_do_not_mix() {
        let a = queued_task("task_1000_1", "build", "compile workspace", 5);
        let b = queued_task("task_1000_2", "docs", "write user guide", 5);
        assert!(task_similarity(&a, &b) < 0.5);
    }
}
