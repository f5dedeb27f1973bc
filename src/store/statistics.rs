//! From-scratch statistics recompute.
//!
//! Statistics are never adjusted incrementally. Every store mutation that
//! touches a task rebuilds its job's aggregate from the full task set, so
//! the counts cannot drift, including across restarts.

use super::model::{Statistics, Task, TaskStatus};

/// Computes a job's statistics from all of its tasks.
pub fn compute<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Statistics {
    let mut stats = Statistics::default();
    for task in tasks {
        tally(&mut stats, task.status, task.row_count());
    }
    stats
}

/// Adds one task's contribution to `stats`.
///
/// Shared with the SQLite store, which folds `(status, count, rows)` groups
/// instead of full task records.
pub(crate) fn tally(stats: &mut Statistics, status: TaskStatus, rows: u64) {
    add_grouped(stats, status, 1, rows);
}

pub(crate) fn add_grouped(stats: &mut Statistics, status: TaskStatus, count: u64, rows: u64) {
    stats.total += count;
    match status {
        TaskStatus::Pending => stats.pending += count,
        TaskStatus::Running => stats.running += count,
        TaskStatus::Completed => {
            stats.completed += count;
            stats.total_rows += rows;
        }
        TaskStatus::Failed => stats.failed += count,
        TaskStatus::Cancelled => stats.cancelled += count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{ExtractionConfig, NewJob, Row, TaskResult, TaskUpdate};
    use chrono::Utc;

    fn rows(n: usize) -> TaskResult {
        TaskResult::new((0..n).map(|_| Row::new()).collect())
    }

    #[test]
    fn test_compute_counts_every_status() {
        let now = Utc::now();
        let urls = (0..5).map(|i| format!("https://example.com/{}", i)).collect();
        let (_, mut tasks) = NewJob::new(ExtractionConfig::new("tr"), urls)
            .build(now)
            .unwrap();

        TaskUpdate::running(now).apply(&mut tasks[0]);
        TaskUpdate::completed(rows(4), now).apply(&mut tasks[1]);
        TaskUpdate::completed(rows(2), now).apply(&mut tasks[2]);
        TaskUpdate::failed("boom", now).apply(&mut tasks[3]);
        TaskUpdate::cancelled(now).apply(&mut tasks[4]);

        let stats = compute(&tasks);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.total_rows, 6);
        assert_eq!(
            stats.total,
            stats.pending + stats.running + stats.completed + stats.failed + stats.cancelled
        );
    }

    #[test]
    fn test_completed_task_with_zero_rows_still_counts() {
        let now = Utc::now();
        let (_, mut tasks) = NewJob::new(
            ExtractionConfig::new("tr"),
            vec!["https://example.com".to_string()],
        )
        .build(now)
        .unwrap();
        TaskUpdate::completed(rows(0), now).apply(&mut tasks[0]);

        let stats = compute(&tasks);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total_rows, 0);
    }

    #[test]
    fn test_grouped_fold_matches_per_task_fold() {
        let mut grouped = Statistics::default();
        add_grouped(&mut grouped, TaskStatus::Completed, 3, 10);
        add_grouped(&mut grouped, TaskStatus::Pending, 2, 0);

        let mut single = Statistics::default();
        tally(&mut single, TaskStatus::Completed, 4);
        tally(&mut single, TaskStatus::Completed, 6);
        tally(&mut single, TaskStatus::Completed, 0);
        tally(&mut single, TaskStatus::Pending, 0);
        tally(&mut single, TaskStatus::Pending, 0);

        assert_eq!(grouped, single);
    }
}
