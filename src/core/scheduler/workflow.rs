//! Workflow chains and dependency gating.
//!
//! Admitting a task of a recognized workflow type atomically creates the
//! rest of its chain as blocked tasks, each depending on its predecessor
//! with step-decreasing priority. Completion unblocks dependents; failure
//! cascades a cancellation through them.

use crate::infrastructure::persistence::QueueDocument;
use crate::tasks::task::{Task, TaskStatus};
use std::collections::HashMap;

/// Fixed task-type chains keyed by their seed type.
const WORKFLOW_CHAINS: [(&str, &[&str]); 2] = [
    ("debug", &["debug", "test", "build"]),
    ("implement", &["implement", "generate", "test", "build", "docs"]),
];

/// Chain of task types seeded by `task_type`, if one is recognized.
#[must_use]
pub fn chain_for(task_type: &str) -> Option<&'static [&'static str]> {
    WORKFLOW_CHAINS
        .iter()
        .find(|(seed, _)| *seed == task_type)
        .map(|(_, chain)| *chain)
}

/// Create the remaining chain behind an admitted seed task.
///
/// Step `i` gets priority `seed.priority - i` (floored at 1) and depends on
/// its predecessor. Returns the created task ids in chain order.
pub fn expand_chain(
    doc: &mut QueueDocument,
    seed: &Task,
    now: i64,
    next_id: &mut dyn FnMut() -> String,
) -> Vec<String> {
    let Some(chain) = chain_for(&seed.task_type) else {
        return Vec::new();
    };

    let mut created = Vec::new();
    let mut previous_id = seed.id.clone();

    for (step, task_type) in chain.iter().enumerate().skip(1) {
        let id = next_id();
        let priority = seed.priority.saturating_sub(step as u8).max(1);
        let task = Task::new(
            id.clone(),
            (*task_type).to_string(),
            format!("{} (step {} of {})", seed.description, step + 1, chain.len()),
            priority,
            now,
        )
        .with_dependencies(vec![previous_id.clone()])
        .with_workflow(seed.task_type.clone(), step as u32 + 1, seed.id.clone());

        doc.tasks.push(task);
        previous_id = id.clone();
        created.push(id);
    }

    created
}

/// Index from task id to the ids of tasks depending on it.
#[must_use]
pub fn children_index(doc: &QueueDocument) -> HashMap<String, Vec<String>> {
    let mut index: HashMap<String, Vec<String>> = HashMap::new();
    for task in &doc.tasks {
        for dep in &task.dependencies {
            index.entry(dep.clone()).or_default().push(task.id.clone());
        }
    }
    index
}

/// Unblock tasks whose dependencies are all complete after `completed_id`
/// finished. Returns the ids moved from `blocked` to `queued`.
pub fn on_dependency_completed(doc: &mut QueueDocument, completed_id: &str) -> Vec<String> {
    let index = children_index(doc);
    let Some(children) = index.get(completed_id) else {
        return Vec::new();
    };

    let mut unblocked = Vec::new();
    for child_id in children {
        let all_met = doc
            .find_task(child_id)
            .map(|t| {
                t.status == TaskStatus::Blocked
                    && t.dependencies.iter().all(|d| doc.dependency_met(d))
            })
            .unwrap_or(false);

        if all_met {
            if let Some(task) = doc.find_task_mut(child_id) {
                task.status = TaskStatus::Queued;
                unblocked.push(child_id.clone());
            }
        }
    }
    unblocked
}

/// Cascade a failure through every transitive dependent of `failed_id`.
///
/// Each affected task is cancelled and recorded as failed with the reason
/// naming its failed dependency. Returns the cancelled ids.
pub fn on_dependency_failed(doc: &mut QueueDocument, failed_id: &str, now: i64) -> Vec<String> {
    let mut cancelled = Vec::new();
    let mut frontier = vec![failed_id.to_string()];

    while let Some(current) = frontier.pop() {
        let index = children_index(doc);
        let Some(children) = index.get(&current) else {
            continue;
        };

        for child_id in children.clone() {
            let Some(task) = doc.find_task_mut(&child_id) else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            task.status = TaskStatus::Cancelled;
            task.failed_at = Some(now);
            task.last_error = Some(format!("Cancelled due to failed dependency: {current}"));
            if doc.move_to_failed(&child_id).is_ok() {
                cancelled.push(child_id.clone());
                frontier.push(child_id);
            }
        }
    }
    cancelled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(task_type: &str, priority: u8) -> Task {
        Task::new(
            "task_1000_1".to_string(),
            task_type.to_string(),
            "Fix crash in module X".to_string(),
            priority,
            1_000,
        )
    }

    fn id_gen() -> impl FnMut() -> String {
        let mut n = 1;
        move || {
            n += 1;
            format!("task_1000_{n}")
        }
    }

    #[test]
    fn debug_chain_creates_test_and_build() {
        let mut doc = QueueDocument::default();
        let seed = seed("debug", 8);
        doc.tasks.push(seed.clone());

        let mut next_id = id_gen();
        let created = expand_chain(&mut doc, &seed, 1_000, &mut next_id);
        assert_eq!(created.len(), 2);
        assert_eq!(doc.tasks.len(), 3);

        let test_task = doc.find_task(&created[0]).unwrap();
        assert_eq!(test_task.task_type, "test");
        assert_eq!(test_task.priority, 7);
        assert_eq!(test_task.status, TaskStatus::Blocked);
        assert_eq!(test_task.dependencies, vec!["task_1000_1".to_string()]);

        let build_task = doc.find_task(&created[1]).unwrap();
        assert_eq!(build_task.task_type, "build");
        assert_eq!(build_task.priority, 6);
        assert_eq!(build_task.dependencies, vec![created[0].clone()]);
        assert_eq!(build_task.parent_task_id.as_deref(), Some("task_1000_1"));
    }

    #[test]
    fn implement_chain_has_five_steps() {
        let mut doc = QueueDocument::default();
        let seed = seed("implement", 9);
        doc.tasks.push(seed.clone());

        let mut next_id = id_gen();
        let created = expand_chain(&mut doc, &seed, 1_000, &mut next_id);
        assert_eq!(created.len(), 4);
        let types: Vec<&str> = created
            .iter()
            .map(|id| doc.find_task(id).unwrap().task_type.as_str())
            .collect();
        assert_eq!(types, vec!["generate", "test", "build", "docs"]);
    }

    #[test]
    fn unrecognized_types_create_no_chain() {
        let mut doc = QueueDocument::default();
        let seed = seed("docs", 5);
        doc.tasks.push(seed.clone());
        let mut next_id = id_gen();
        assert!(expand_chain(&mut doc, &seed, 1_000, &mut next_id).is_empty());
        assert_eq!(doc.tasks.len(), 1);
    }

    #[test]
    fn completion_unblocks_only_fully_satisfied_dependents() {
        let mut doc = QueueDocument::default();
        let a = seed("debug", 8);
        doc.tasks.push(a.clone());
        let mut next_id = id_gen();
        expand_chain(&mut doc, &a, 1_000, &mut next_id);

        // complete the seed
        doc.find_task_mut("task_1000_1").unwrap().status = TaskStatus::Completed;
        doc.move_to_completed("task_1000_1").unwrap();

        let unblocked = on_dependency_completed(&mut doc, "task_1000_1");
        assert_eq!(unblocked, vec!["task_1000_2".to_string()]);
        // build step still waits on test
        assert_eq!(
            doc.find_task("task_1000_3").unwrap().status,
            TaskStatus::Blocked
        );
    }

    #[test]
    fn failure_cascades_through_the_whole_chain() {
        let mut doc = QueueDocument::default();
        let a = seed("debug", 8);
        doc.tasks.push(a.clone());
        let mut next_id = id_gen();
        expand_chain(&mut doc, &a, 1_000, &mut next_id);

        doc.find_task_mut("task_1000_1").unwrap().status = TaskStatus::Failed;
        doc.move_to_failed("task_1000_1").unwrap();

        let cancelled = on_dependency_failed(&mut doc, "task_1000_1", 2_000);
        assert_eq!(cancelled.len(), 2);
        assert!(doc.tasks.is_empty());
        assert_eq!(doc.failed.len(), 3);

        let reason = doc
            .failed
            .iter()
            .find(|t| t.id == "task_1000_2")
            .and_then(|t| t.last_error.clone())
            .unwrap();
        assert_eq!(reason, "Cancelled due to failed dependency: task_1000_1");
    }
}
