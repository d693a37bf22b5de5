//! Effective task priority.
//!
//! Recomputed on every tick from the stored base priority plus type,
//! content and age bonuses. The age branches do not stack: past 72 hours
//! the +2 bonus replaces the 24-hour +1.

use crate::tasks::compression;
use crate::tasks::task::Task;

/// Keywords that mark a description as urgent.
const URGENT_KEYWORDS: [&str; 9] = [
    "urgent",
    "critical",
    "emergency",
    "security",
    "vulnerability",
    "crash",
    "error",
    "fix",
    "bug",
];

/// Task types treated as critical during dispatch ordering.
pub const CRITICAL_TYPES: [&str; 3] = ["debug", "security", "emergency"];

const DAY_SECS: i64 = 24 * 3600;

/// Compute a task's effective priority at `now`, clamped to [1, 10].
#[must_use]
pub fn effective_priority(task: &Task, now: i64) -> u8 {
    let mut p = i32::from(task.priority);

    match task.task_type.as_str() {
        "debug" | "security" | "emergency" => p += 3,
        "build" | "test" => p += 1,
        "cleanup" | "organize" => p -= 1,
        _ => {}
    }

    let description = compression::decompress(&task.description)
        .unwrap_or_else(|_| task.description.clone())
        .to_lowercase();
    if URGENT_KEYWORDS.iter().any(|k| description.contains(k)) {
        p += 2;
    }

    let age = task.age_secs(now);
    if age > 3 * DAY_SECS {
        p += 2;
    } else if age > DAY_SECS {
        p += 1;
    }

    p.clamp(1, 10) as u8
}

/// True when the task takes the critical dispatch pass.
#[must_use]
pub fn is_critical(task: &Task, now: i64) -> bool {
    CRITICAL_TYPES.contains(&task.task_type.as_str()) || effective_priority(task, now) >= 8
}

/// Sort task indices by descending effective priority, older first on ties.
pub fn sort_by_priority(tasks: &mut [Task], now: i64) {
    tasks.sort_by(|a, b| {
        effective_priority(b, now)
            .cmp(&effective_priority(a, now))
            .then(a.created.cmp(&b.created))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(task_type: &str, description: &str, priority: u8, created: i64) -> Task {
        Task::new(
            format!("task_{created}_1"),
            task_type.to_string(),
            description.to_string(),
            priority,
            created,
        )
    }

    #[test]
    fn type_bonuses_apply() {
        let now = 10_000;
        assert_eq!(
            effective_priority(&task("debug", "look into it", 4, now), now),
            7
        );
        assert_eq!(
            effective_priority(&task("build", "compile it", 4, now), now),
            5
        );
        assert_eq!(
            effective_priority(&task("cleanup", "tidy workspace", 4, now), now),
            3
        );
        assert_eq!(
            effective_priority(&task("docs", "write a guide", 4, now), now),
            4
        );
    }

    #[test]
    fn keyword_bonus_is_case_insensitive() {
        let now = 10_000;
        assert_eq!(
            effective_priority(&task("docs", "URGENT: release notes", 4, now), now),
            6
        );
    }

    #[test]
    fn age_bonus_replaces_rather_than_stacks() {
        let now = 100 * 24 * 3600;
        let day_old = task("docs", "write a guide", 5, now - 30 * 3600);
        assert_eq!(effective_priority(&day_old, now), 6);

        let week_old = task("docs", "write a guide", 5, now - 80 * 3600);
        // +2 only, not +3
        assert_eq!(effective_priority(&week_old, now), 7);
    }

    #[test]
    fn priority_clamps_at_ten() {
        let now = 100 * 24 * 3600;
        // base 9, age > 72h would push past the cap
        let old_urgent = task("debug", "urgent crash", 9, now - 80 * 3600);
        assert_eq!(effective_priority(&old_urgent, now), 10);
    }

    #[test]
    fn priority_clamps_at_one() {
        let now = 10_000;
        let low = task("cleanup", "tidy up the desk", 1, now);
        assert_eq!(effective_priority(&low, now), 1);
    }

    #[test]
    fn ties_break_by_age() {
        let now = 10_000;
        let mut tasks = vec![
            task("docs", "write a guide", 5, 2_000),
            task("docs", "write a manual", 5, 1_000),
        ];
        sort_by_priority(&mut tasks, now);
        assert_eq!(tasks[0].created, 1_000);
    }

    #[test]
    fn critical_pass_membership() {
        let now = 10_000;
        assert!(is_critical(&task("security", "audit deps", 2, now), now));
        assert!(is_critical(&task("docs", "urgent fix notes", 7, now), now));
        assert!(!is_critical(&task("docs", "weekly notes", 5, now), now));
    }
}
