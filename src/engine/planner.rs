//! Planner runner: prompts an agent for a plan and appends the parsed tasks.
//!
//! The plan must be strict JSON. Before deserializing, the candidate text is
//! validated against an embedded JSON Schema (Draft 2020-12); extraction falls
//! back through three regexes and finally the whole output. A plan that never
//! parses yields an empty task list — the planner never invents tasks.

use std::sync::{LazyLock, Mutex, MutexGuard};

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::agents::manager::ExecutorManager;
use crate::core::task::{Task, TaskStore};
use crate::engine::prompt::{PromptPack, TaskSummaries};

const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/plan_output.schema.json"
));

/// Hard caps from the planner contract.
pub const MAX_TASKS_PER_PLAN: usize = 10;
pub const MAX_SUB_PLANNERS: usize = 5;
pub const MAX_TASKS_PER_SUB_PLAN: usize = 5;

/// One task as emitted by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub success_criteria: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub needs_web_search: Option<bool>,
}

/// A delegated planning area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubPlannerSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Parsed planner output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutput {
    pub analysis: String,
    pub tasks: Vec<PlannedTask>,
    #[serde(default)]
    pub spawn_sub_planners: Option<Vec<SubPlannerSpec>>,
}

static PLAN_OBJECT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r#"(?s)\{.*"analysis".*"tasks".*\}"#).expect("plan object regex")
});
static JSON_FENCE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?s)```json\s*(.*?)```").expect("json fence regex"));
static ANY_FENCE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?s)```\w*\s*(.*?)```").expect("any fence regex"));

fn candidates(output: &str) -> Vec<String> {
    let mut found = Vec::new();
    if let Some(m) = PLAN_OBJECT_RE.find(output) {
        found.push(m.as_str().to_string());
    }
    if let Some(caps) = JSON_FENCE_RE.captures(output) {
        found.push(caps[1].to_string());
    }
    if let Some(caps) = ANY_FENCE_RE.captures(output) {
        found.push(caps[1].to_string());
    }
    found.push(output.trim().to_string());
    found
}

fn validate_against_schema(instance: &Value) -> Result<()> {
    static SCHEMA: LazyLock<jsonschema::Validator> = LazyLock::new(|| {
        let schema: Value = serde_json::from_str(PLAN_SCHEMA).expect("plan schema parses");
        jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .expect("plan schema compiles")
    });
    let messages: Vec<String> = SCHEMA.iter_errors(instance).map(|e| e.to_string()).collect();
    if !messages.is_empty() {
        bail!("plan schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Parse agent output into a plan, trying each extraction in order.
///
/// Returns `None` when no candidate both validates and deserializes; the
/// caller must treat that as an empty plan.
pub fn parse_plan(output: &str) -> Option<PlanOutput> {
    for candidate in candidates(output) {
        let Ok(value) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };
        if let Err(err) = validate_against_schema(&value) {
            debug!(error = %err, "plan candidate rejected by schema");
            continue;
        }
        match serde_json::from_value::<PlanOutput>(value) {
            Ok(mut plan) => {
                plan.tasks.truncate(MAX_TASKS_PER_PLAN);
                if let Some(subs) = plan.spawn_sub_planners.as_mut() {
                    subs.truncate(MAX_SUB_PLANNERS);
                }
                return Some(plan);
            }
            Err(err) => debug!(error = %err, "plan candidate failed to deserialize"),
        }
    }
    None
}

/// Fold the planner's success criteria into the task description so workers
/// see it without a dedicated field.
fn task_description(planned: &PlannedTask) -> String {
    let criteria = planned.success_criteria.trim();
    if criteria.is_empty() {
        return planned.description.clone();
    }
    format!("{}\n\nSuccess criteria: {criteria}", planned.description)
}

/// Inputs for one planner run.
#[derive(Debug, Clone)]
pub struct PlannerContext<'a> {
    pub goal: &'a str,
    pub cycle: u32,
    pub max_cycles: u32,
    pub default_max_attempts: u32,
}

/// Runs the planner (and any sub-planners) and appends new tasks to the store.
pub struct PlannerRunner<'a> {
    pub manager: &'a ExecutorManager,
    pub prompts: &'a PromptPack,
    pub store: &'a Mutex<TaskStore>,
}

impl<'a> PlannerRunner<'a> {
    fn lock_store(&self) -> MutexGuard<'_, TaskStore> {
        self.store.lock().expect("task store lock poisoned")
    }

    /// Run one planning pass: prompt, parse, append tasks, fan out
    /// sub-planners. Returns all newly created tasks.
    #[instrument(skip_all, fields(cycle = ctx.cycle))]
    pub fn run(&self, ctx: &PlannerContext<'_>) -> Result<Vec<Task>> {
        let summaries = {
            let store = self.lock_store();
            TaskSummaries::gather(&store)
        };
        let prompt = self
            .prompts
            .render_planner(ctx.goal, ctx.cycle, ctx.max_cycles, &summaries);
        let (result, kind) = self
            .manager
            .execute_raw(&prompt, "planner")
            .context("planner execution")?;

        let Some(plan) = parse_plan(&result.output) else {
            warn!(kind = %kind, "planner output did not parse; creating no tasks");
            return Ok(Vec::new());
        };
        debug!(analysis = %plan.analysis, tasks = plan.tasks.len(), "plan parsed");

        let mut created = self.append_tasks(&plan.tasks, "planner", ctx.default_max_attempts)?;

        if let Some(areas) = plan.spawn_sub_planners.as_deref() {
            if !areas.is_empty() {
                let mut sub_tasks = self.run_sub_planners(ctx, areas)?;
                created.append(&mut sub_tasks);
            }
        }

        info!(created = created.len(), "planner finished");
        Ok(created)
    }

    /// Run one sub-planner per area in parallel and aggregate their tasks.
    fn run_sub_planners(
        &self,
        ctx: &PlannerContext<'_>,
        areas: &[SubPlannerSpec],
    ) -> Result<Vec<Task>> {
        let plans: Vec<Option<PlanOutput>> = std::thread::scope(|scope| {
            let handles: Vec<_> = areas
                .iter()
                .map(|area| {
                    scope.spawn(move || {
                        let prompt = self.prompts.render_sub_planner(
                            ctx.goal,
                            &area.name,
                            &area.description,
                            &area.files,
                        );
                        let label = format!("sub-planner:{}", area.name);
                        match self.manager.execute_raw(&prompt, &label) {
                            Ok((result, _)) => parse_plan(&result.output),
                            Err(err) => {
                                warn!(area = %area.name, error = %format!("{err:#}"), "sub-planner failed");
                                None
                            }
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_default())
                .collect()
        });

        let mut created = Vec::new();
        for (area, plan) in areas.iter().zip(plans) {
            let Some(mut plan) = plan else {
                warn!(area = %area.name, "sub-planner produced no parseable plan");
                continue;
            };
            plan.tasks.truncate(MAX_TASKS_PER_SUB_PLAN);
            let label = format!("sub-planner:{}", area.name);
            let mut tasks = self.append_tasks(&plan.tasks, &label, ctx.default_max_attempts)?;
            created.append(&mut tasks);
        }
        Ok(created)
    }

    fn append_tasks(
        &self,
        planned: &[PlannedTask],
        created_by: &str,
        max_attempts: u32,
    ) -> Result<Vec<Task>> {
        let mut store = self.lock_store();
        let mut created = Vec::new();
        for item in planned {
            if item.title.trim().is_empty() || item.description.trim().is_empty() {
                warn!(title = %item.title, "skipping planned task with empty title/description");
                continue;
            }
            let task = store.create_task(
                item.title.trim(),
                &task_description(item),
                created_by,
                item.files.clone(),
                max_attempts,
                item.needs_web_search.unwrap_or(false),
            );
            store.add(task.clone())?;
            created.push(task);
        }
        Ok(created)
    }
}
