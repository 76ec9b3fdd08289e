//! C7: pure queries over execution order and the completed/failed task
//! sets. Unlike the DAG scheduler this is generalized from, groups here are
//! pre-ordered by planning rather than resolved from a dependency graph, so
//! there is no wave computation — just linear index arithmetic.

use std::collections::HashSet;

use crate::session::TaskId;

/// The execution order: a list of groups, each a list of task IDs.
pub type ExecutionOrder = Vec<Vec<TaskId>>;

/// The group index containing `task_id`, or `None` if it appears in no group.
pub fn get_task_group_index(order: &ExecutionOrder, task_id: &str) -> Option<usize> {
    order.iter().position(|group| group.iter().any(|id| id == task_id))
}

pub fn get_group_tasks(order: &ExecutionOrder, group_index: usize) -> &[TaskId] {
    order.get(group_index).map(Vec::as_slice).unwrap_or(&[])
}

pub fn total_groups(order: &ExecutionOrder) -> usize {
    order.len()
}

pub fn has_more_groups(order: &ExecutionOrder, current_group_index: usize) -> bool {
    current_group_index + 1 < order.len()
}

/// A group is complete once every one of its tasks has landed in either
/// `completed` or `failed`.
pub fn is_group_complete(
    order: &ExecutionOrder,
    group_index: usize,
    completed: &HashSet<TaskId>,
    failed: &HashSet<TaskId>,
) -> bool {
    let tasks = get_group_tasks(order, group_index);
    !tasks.is_empty() && tasks.iter().all(|id| completed.contains(id) || failed.contains(id))
}

/// A group has a partial failure when it has both at least one completed
/// and at least one failed task.
pub fn has_partial_failure(
    order: &ExecutionOrder,
    group_index: usize,
    completed: &HashSet<TaskId>,
    failed: &HashSet<TaskId>,
) -> bool {
    let tasks = get_group_tasks(order, group_index);
    let any_completed = tasks.iter().any(|id| completed.contains(id));
    let any_failed = tasks.iter().any(|id| failed.contains(id));
    any_completed && any_failed
}

pub fn advance_group(current_group_index: usize) -> usize {
    current_group_index + 1
}
