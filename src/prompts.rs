//! Prompt template construction for the planner, plan selector, and
//! consolidator workers. The core builds these strings and hands them to
//! the worker pool — it never calls a model itself (§1 Non-goals).
//!
//! Structure mirrors `PLANNER_SYSTEM_PROMPT` (`src/factory/planner.rs`) for
//! the schema-instructions style, and the PR-body template in
//! `src/factory/pipeline.rs` for the "Created by" footer convention.

use crate::session::{AggregatedContext, GroupConsolidationRecord, Task};

/// System-level instructions shared by every planner-coordinator spawn,
/// describing the required JSON plan shape. Mirrors `PLANNER_SYSTEM_PROMPT`'s
/// register: imperative rules, explicit schema, explicit "do not" list.
pub const PLANNER_SYSTEM_PROMPT: &str = r#"You are a planning coordinator for an automated multi-agent code-modification system.

Given a high-level objective, decompose it into a dependency-ordered plan of
tasks. Respond with a single JSON object of this shape:

{
  "reasoning": "<brief rationale for this decomposition>",
  "groups": [
    {
      "tasks": [
        {
          "id": "<short stable id>",
          "title": "<imperative title>",
          "description": "<what the task should do and why>",
          "expected_files": ["<path>", ...],
          "no_code": false
        }
      ]
    }
  ]
}

Rules:
- Tasks within the same group are dispatched in parallel and must not touch
  the same files.
- Groups run strictly in order; a later group may depend on an earlier
  group's changes already being merged.
- Do not over-decompose a simple objective into more tasks than it needs.
- Set "no_code": true only for tasks that are expected to produce no
  commits (investigation, review-only tasks).
- Do not include verification, testing, or consolidation as separate tasks
  — those are handled by the system, not by planned tasks.
"#;

/// Builds the prompt handed to a single planner-coordinator instance.
pub fn build_planning_prompt(objective: &str, coordinator_label: Option<&str>) -> String {
    let mut prompt = String::new();
    prompt.push_str(PLANNER_SYSTEM_PROMPT);
    prompt.push_str("\n\n## Objective\n\n");
    prompt.push_str(objective);
    if let Some(label) = coordinator_label {
        prompt.push_str(&format!(
            "\n\n## Your Perspective\n\nYou are coordinator \"{label}\" in a multi-pass planning round. \
             Produce a plan independently; do not assume the other coordinators' output.\n"
        ));
    }
    prompt
}

/// Builds the prompt for the plan-selector instance, given the raw plan
/// JSON text produced by each coordinator.
pub fn build_plan_selection_prompt(objective: &str, candidate_plans: &[String]) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are selecting the best plan from several independently generated candidates ");
    prompt.push_str("for the same objective.\n\n## Objective\n\n");
    prompt.push_str(objective);
    prompt.push_str("\n\n## Candidate Plans\n");
    for (i, plan) in candidate_plans.iter().enumerate() {
        prompt.push_str(&format!("\n### Candidate {}\n\n{}\n", i + 1, plan));
    }
    prompt.push_str(
        "\n## Instructions\n\nRespond with the single best plan, verbatim in the same JSON shape \
         the candidates use, optionally improved by combining ideas from multiple candidates.\n",
    );
    prompt
}

/// Builds the prompt handed to a single task worker, describing the task
/// and the sentinel file it must write to signal completion (§4.4/§6).
pub fn build_task_prompt(task: &Task, base_branch: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Task: {}\n\n", task.title));
    prompt.push_str(&task.description);
    prompt.push('\n');

    if !task.expected_files.is_empty() {
        prompt.push_str("\n## Expected Files\n\n");
        for file in &task.expected_files {
            prompt.push_str(&format!("- {file}\n"));
        }
    }

    prompt.push_str("\n## Branch Configuration\n\n");
    prompt.push_str(&format!("- Base branch: `{base_branch}`\n"));

    if task.no_code {
        prompt.push_str(
            "\n## Notes\n\nThis is an investigation/verification task: it is not expected to \
             produce commits.\n",
        );
    }

    prompt.push_str("\n## Completion Protocol\n\n");
    prompt.push_str(&format!(
        "Write `.claudio-task-complete.json` to the worktree root with task_id \"{}\" before \
         exiting.\n",
        task.id
    ));

    prompt
}

/// Builds the structured prompt for the consolidator worker responsible for
/// one group (§4.5's template sections).
pub struct ConsolidatorPromptInput<'a> {
    pub group_index: usize,
    pub total_groups: usize,
    pub plan_summary: &'a str,
    pub tasks: &'a [Task],
    pub aggregated: &'a AggregatedContext,
    pub previous_group_context: Option<&'a GroupConsolidationRecord>,
    pub base_branch: &'a str,
    pub target_branch: &'a str,
}

pub fn build_consolidator_prompt(input: &ConsolidatorPromptInput) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "# Group {} Consolidation\n\n",
        input.group_index + 1
    ));

    prompt.push_str("## Plan Summary\n\n");
    prompt.push_str(input.plan_summary);
    prompt.push('\n');

    prompt.push_str("\n## Tasks Completed\n\n");
    for task in input.tasks {
        prompt.push_str(&format!("- **{}**: {}\n", task.title, task.description));
    }

    if !input.aggregated.notes.is_empty() {
        prompt.push_str("\n## Implementation Notes\n\n");
        for note in &input.aggregated.notes {
            prompt.push_str(&format!("- {note}\n"));
        }
    }

    if !input.aggregated.all_issues.is_empty() {
        prompt.push_str("\n## Issues Raised\n\n");
        for (task_id, summary) in input.aggregated.task_summaries.iter() {
            for issue in &input.aggregated.all_issues {
                prompt.push_str(&format!("- [{task_id}] {issue} (context: {summary})\n"));
            }
        }
    }

    if !input.aggregated.all_suggestions.is_empty() {
        prompt.push_str("\n## Integration Suggestions\n\n");
        for suggestion in &input.aggregated.all_suggestions {
            prompt.push_str(&format!("- {suggestion}\n"));
        }
    }

    if let Some(previous) = input.previous_group_context {
        prompt.push_str("\n## Context from Previous Group's Consolidator\n\n");
        if !previous.issues_for_next_group.is_empty() {
            for issue in &previous.issues_for_next_group {
                prompt.push_str(&format!("- {issue}\n"));
            }
        } else {
            prompt.push_str("(no carried-over issues)\n");
        }
    }

    prompt.push_str("\n## Branch Configuration\n\n");
    prompt.push_str(&format!("- Base branch: `{}`\n", input.base_branch));
    prompt.push_str(&format!("- Target branch: `{}`\n", input.target_branch));

    prompt.push_str("\n## Your Tasks\n\n");
    prompt.push_str(
        "Verify the consolidated branch builds and passes its tests, resolve any remaining \
         integration issues, and summarize the group's outcome.\n",
    );

    prompt.push_str("\n## Completion Protocol\n\n");
    prompt.push_str(&format!(
        "Write `.claudio-group-consolidation-complete.json` to the worktree root describing \
         group {} ({} of {} total) before exiting.\n",
        input.group_index + 1,
        input.group_index + 1,
        input.total_groups
    ));

    prompt
}

/// The PR description used when opening a pull request for a consolidated
/// group branch, mirroring the "Created by" footer convention.
pub fn build_pull_request_body(group_title: &str, summary: &str) -> String {
    format!(
        "## Summary\n\nAutomated consolidation for: **{}**\n\n{}\n\n---\n*Created by Claudio*",
        group_title,
        if summary.is_empty() { "No summary provided." } else { summary }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_prompt_includes_title_and_sentinel_filename() {
        let task = Task::new("t1", "Add login", "Implement login flow")
            .with_expected_files(vec!["src/auth.rs".to_string()]);
        let prompt = build_task_prompt(&task, "main");
        assert!(prompt.contains("# Task: Add login"));
        assert!(prompt.contains("src/auth.rs"));
        assert!(prompt.contains("Base branch: `main`"));
        assert!(prompt.contains(".claudio-task-complete.json"));
        assert!(prompt.contains("\"t1\""));
        assert!(!prompt.contains("investigation/verification"));
    }

    #[test]
    fn task_prompt_notes_no_code_tasks() {
        let task = Task::new("t2", "Investigate flaky test", "desc").with_no_code(true);
        let prompt = build_task_prompt(&task, "main");
        assert!(prompt.contains("investigation/verification"));
    }

    #[test]
    fn planning_prompt_includes_objective() {
        let prompt = build_planning_prompt("add dark mode", None);
        assert!(prompt.contains("add dark mode"));
        assert!(prompt.contains("Rules:"));
    }

    #[test]
    fn planning_prompt_labels_coordinator_in_multi_pass() {
        let prompt = build_planning_prompt("add dark mode", Some("alpha"));
        assert!(prompt.contains("coordinator \"alpha\""));
    }

    #[test]
    fn plan_selection_prompt_lists_all_candidates() {
        let prompt = build_plan_selection_prompt("obj", &["plan A".to_string(), "plan B".to_string()]);
        assert!(prompt.contains("Candidate 1"));
        assert!(prompt.contains("plan A"));
        assert!(prompt.contains("Candidate 2"));
        assert!(prompt.contains("plan B"));
    }

    #[test]
    fn consolidator_prompt_includes_required_sections() {
        let tasks = vec![Task::new("t1", "Add auth", "Implement login")];
        let mut aggregated = AggregatedContext::default();
        aggregated.notes.push("used bcrypt for hashing".to_string());
        aggregated.all_suggestions.push("consider rate limiting".to_string());
        aggregated.task_summaries.insert("t1".to_string(), "done".to_string());

        let input = ConsolidatorPromptInput {
            group_index: 1,
            total_groups: 3,
            plan_summary: "Build auth then profile pages",
            tasks: &tasks,
            aggregated: &aggregated,
            previous_group_context: None,
            base_branch: "claudio/ultraplan-abcd1234-group-1",
            target_branch: "claudio/ultraplan-abcd1234-group-2",
        };
        let prompt = build_consolidator_prompt(&input);

        assert!(prompt.contains("# Group 2 Consolidation"));
        assert!(prompt.contains("## Tasks Completed"));
        assert!(prompt.contains("Add auth"));
        assert!(prompt.contains("## Implementation Notes"));
        assert!(prompt.contains("bcrypt"));
        assert!(prompt.contains("## Integration Suggestions"));
        assert!(prompt.contains("rate limiting"));
        assert!(prompt.contains("## Branch Configuration"));
        assert!(prompt.contains("claudio/ultraplan-abcd1234-group-1"));
        assert!(prompt.contains(".claudio-group-consolidation-complete.json"));
        assert!(!prompt.contains("Context from Previous Group"));
    }

    #[test]
    fn consolidator_prompt_carries_previous_group_context_after_first_group() {
        let tasks = vec![Task::new("t1", "Title", "Desc")];
        let aggregated = AggregatedContext::default();
        let previous = GroupConsolidationRecord {
            group_index: 0,
            status: crate::session::GroupConsolidationStatus::Complete,
            consolidated_branch: "claudio/group-1".to_string(),
            tasks_included: vec!["t0".to_string()],
            conflicts_resolved: vec![],
            verification: Default::default(),
            aggregated_context: AggregatedContext::default(),
            notes: String::new(),
            issues_for_next_group: vec!["watch out for the shared config file".to_string()],
        };
        let input = ConsolidatorPromptInput {
            group_index: 1,
            total_groups: 2,
            plan_summary: "",
            tasks: &tasks,
            aggregated: &aggregated,
            previous_group_context: Some(&previous),
            base_branch: "claudio/group-1",
            target_branch: "claudio/group-2",
        };
        let prompt = build_consolidator_prompt(&input);
        assert!(prompt.contains("Context from Previous Group's Consolidator"));
        assert!(prompt.contains("shared config file"));
    }

    #[test]
    fn pull_request_body_has_footer_and_falls_back_on_empty_summary() {
        let body = build_pull_request_body("Group 1", "");
        assert!(body.contains("Created by Claudio"));
        assert!(body.contains("No summary provided."));
    }

    #[test]
    fn pull_request_body_includes_non_empty_summary() {
        let body = build_pull_request_body("Group 1", "Implemented login and profile pages.");
        assert!(body.contains("Implemented login and profile pages."));
    }
}
