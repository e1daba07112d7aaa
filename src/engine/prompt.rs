//! Prompt rendering for the planner, workers, and the judge.
//!
//! Templates are embedded minijinja documents; the inputs are plain structs
//! so rendering stays deterministic given the same session state.

use minijinja::{Environment, context};
use tracing::debug;

use crate::core::task::{Task, TaskStatus, TaskStore};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const SUB_PLANNER_TEMPLATE: &str = include_str!("prompts/sub_planner.md");
const WORKER_TEMPLATE: &str = include_str!("prompts/worker.md");
const JUDGE_TEMPLATE: &str = include_str!("prompts/judge.md");

/// Maximum task lines included per summary section.
const SUMMARY_LIMIT: usize = 20;

/// Template engine wrapper around minijinja.
pub struct PromptPack {
    env: Environment<'static>,
}

impl Default for PromptPack {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptPack {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .expect("planner template should be valid");
        env.add_template("sub_planner", SUB_PLANNER_TEMPLATE)
            .expect("sub_planner template should be valid");
        env.add_template("worker", WORKER_TEMPLATE)
            .expect("worker template should be valid");
        env.add_template("judge", JUDGE_TEMPLATE)
            .expect("judge template should be valid");
        Self { env }
    }

    pub fn render_planner(
        &self,
        goal: &str,
        cycle: u32,
        max_cycles: u32,
        summaries: &TaskSummaries,
    ) -> String {
        let template = self.env.get_template("planner").expect("planner template");
        let rendered = template
            .render(context! {
                goal => goal.trim(),
                cycle => cycle + 1,
                max_cycles => max_cycles,
                completed => non_empty(&summaries.completed),
                failed => non_empty(&summaries.failed),
                pending => non_empty(&summaries.pending),
            })
            .expect("planner template renders");
        debug!(bytes = rendered.len(), "rendered planner prompt");
        rendered
    }

    pub fn render_sub_planner(
        &self,
        goal: &str,
        name: &str,
        description: &str,
        files: &[String],
    ) -> String {
        let template = self
            .env
            .get_template("sub_planner")
            .expect("sub_planner template");
        template
            .render(context! {
                goal => goal.trim(),
                area_name => name,
                area_description => description,
                files => non_empty(&bullet_list(files)),
            })
            .expect("sub_planner template renders")
    }

    pub fn render_worker(&self, goal: &str, task: &Task) -> String {
        let template = self.env.get_template("worker").expect("worker template");
        template
            .render(context! {
                goal => goal.trim(),
                title => task.title,
                description => task.description,
                files => non_empty(&bullet_list(&task.files)),
                needs_web_search => task.needs_web_search,
            })
            .expect("worker template renders")
    }

    pub fn render_judge(
        &self,
        goal: &str,
        cycle: u32,
        max_cycles: u32,
        stats: &CycleStats,
        summaries: &TaskSummaries,
    ) -> String {
        let template = self.env.get_template("judge").expect("judge template");
        template
            .render(context! {
                goal => goal.trim(),
                cycle => cycle + 1,
                max_cycles => max_cycles,
                completed_count => stats.completed,
                failed_count => stats.failed,
                pending_count => stats.pending,
                total_count => stats.total,
                completed => non_empty(&summaries.completed),
                failed => non_empty(&summaries.failed),
            })
            .expect("judge template renders")
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Per-cycle task counts handed to the judge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub total: usize,
}

impl CycleStats {
    pub fn gather(store: &TaskStore) -> Self {
        Self {
            completed: store.count_with_status(TaskStatus::Completed),
            failed: store.count_with_status(TaskStatus::Failed),
            pending: store.count_with_status(TaskStatus::Pending),
            total: store.len(),
        }
    }
}

/// Compact per-status task summaries for prompt context.
#[derive(Debug, Clone, Default)]
pub struct TaskSummaries {
    pub completed: String,
    pub failed: String,
    pub pending: String,
}

impl TaskSummaries {
    pub fn gather(store: &TaskStore) -> Self {
        Self {
            completed: summarize(store, TaskStatus::Completed),
            failed: summarize(store, TaskStatus::Failed),
            pending: summarize(store, TaskStatus::Pending),
        }
    }
}

fn summarize(store: &TaskStore, status: TaskStatus) -> String {
    let mut lines = Vec::new();
    for task in store.tasks().iter().filter(|t| t.status == status) {
        if lines.len() >= SUMMARY_LIMIT {
            lines.push(format!(
                "- ... and {} more",
                store.count_with_status(status) - SUMMARY_LIMIT
            ));
            break;
        }
        let mut line = format!("- [{}] {}", task.id, task.title);
        if status == TaskStatus::Failed {
            if let Some(error) = &task.last_error {
                line.push_str(&format!(" ({}: {})", error.category.as_str(), error.message));
            }
        }
        lines.push(line);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_tasks() -> (tempfile::TempDir, TaskStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = TaskStore::create(temp.path().join("tasks.json")).expect("store");
        let task = store.create_task(
            "Add greeting",
            "Write greet()",
            "planner",
            vec!["greet.rs".to_string()],
            3,
            false,
        );
        store.add(task).expect("add");
        (temp, store)
    }

    /// Verifies the planner prompt carries goal, cycle counters, and summaries.
    #[test]
    fn planner_prompt_includes_goal_and_progress() {
        let (_temp, store) = store_with_tasks();
        let pack = PromptPack::new();
        let summaries = TaskSummaries::gather(&store);
        let prompt = pack.render_planner("build the feature", 0, 20, &summaries);

        assert!(prompt.contains("Planner Contract"));
        assert!(prompt.contains("build the feature"));
        assert!(prompt.contains("Cycle 1 of 20"));
        assert!(prompt.contains("[task-1] Add greeting"));
        assert!(prompt.contains("spawn_sub_planners"));
    }

    /// Verifies the worker prompt lists files and the completion contract.
    #[test]
    fn worker_prompt_lists_files_and_status_contract() {
        let (_temp, store) = store_with_tasks();
        let pack = PromptPack::new();
        let prompt = pack.render_worker("build the feature", &store.tasks()[0]);

        assert!(prompt.contains("Worker Contract"));
        assert!(prompt.contains("Add greeting"));
        assert!(prompt.contains("- greet.rs"));
        assert!(prompt.contains(r#"{"status": "COMPLETED"}"#));
        assert!(prompt.contains("Git conflict? Resolve it yourself."));
    }

    /// Verifies a task without files gets the minimal-changes wording instead.
    #[test]
    fn worker_prompt_without_files_keeps_changes_minimal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = TaskStore::create(temp.path().join("tasks.json")).expect("store");
        let task = store.create_task("t", "d", "planner", Vec::new(), 3, false);
        store.add(task).expect("add");

        let pack = PromptPack::new();
        let prompt = pack.render_worker("goal", &store.tasks()[0]);
        assert!(prompt.contains("No file list was given"));
        assert!(!prompt.contains("Only modify these files"));
    }

    /// Verifies the judge prompt carries counts and the decision vocabulary.
    #[test]
    fn judge_prompt_includes_stats() {
        let (_temp, store) = store_with_tasks();
        let pack = PromptPack::new();
        let stats = CycleStats::gather(&store);
        let summaries = TaskSummaries::gather(&store);
        let prompt = pack.render_judge("goal", 2, 20, &stats, &summaries);

        assert!(prompt.contains("Judge Contract"));
        assert!(prompt.contains("Cycle 3 of 20"));
        assert!(prompt.contains("1 pending"));
        assert!(prompt.contains("CONTINUE | COMPLETE | ABORT"));
    }

    /// Verifies summaries cap their length.
    #[test]
    fn summaries_are_bounded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = TaskStore::create(temp.path().join("tasks.json")).expect("store");
        for i in 0..30 {
            let task = store.create_task(&format!("t{i}"), "d", "planner", Vec::new(), 3, false);
            store.add(task).expect("add");
        }
        let summaries = TaskSummaries::gather(&store);
        assert!(summaries.pending.lines().count() <= SUMMARY_LIMIT + 1);
        assert!(summaries.pending.contains("and 10 more"));
    }
}
