//! Workflow step planning
//!
//! A workflow is an ordered list of steps, each of which costs one model
//! call. [`WorkflowStepPlanner`] merges compatible neighbours into a single
//! step and annotates every step with the complexity and provider hints the
//! call optimizer consumes.

mod chunking;
mod guidelines;

pub use chunking::{ChunkInfo, ContentChunker};
pub use guidelines::{adherence_score, adheres_to_guidelines, extract_key_points};

use crate::api::TaskHints;
use crate::config::WorkflowSettings;
use crate::selector::{classify, preferred_provider, Complexity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// One unit of work in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub task_name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub is_merged: bool,

    /// Original task names, in order, when this step is a merge
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_task_names: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_preference: Option<String>,
}

impl WorkflowStep {
    pub fn new(task_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            description: description.into(),
            is_merged: false,
            source_task_names: Vec::new(),
            complexity: None,
            provider_preference: None,
        }
    }

    /// Request hints for running this step through the call optimizer
    pub fn hints(&self) -> TaskHints {
        TaskHints {
            complexity: self.complexity,
            provider_preference: self.provider_preference.clone(),
            task_name: Some(self.task_name.clone()),
            auto_select_model: true,
        }
    }
}

/// Step counts for one planned workflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WorkflowStats {
    pub original_steps: usize,
    pub optimized_steps: usize,
    pub reduction_percentage: f64,
    pub estimated_api_calls_saved: usize,
}

impl WorkflowStats {
    fn new(original_steps: usize, optimized_steps: usize) -> Self {
        Self {
            original_steps,
            optimized_steps,
            reduction_percentage: reduction(original_steps, optimized_steps),
            estimated_api_calls_saved: original_steps.saturating_sub(optimized_steps),
        }
    }
}

/// Totals across every workflow planned so far
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlannerStats {
    pub workflows_optimized: usize,
    pub total_original_steps: usize,
    pub total_optimized_steps: usize,
    pub total_reduction_percentage: f64,
    pub total_api_calls_saved: usize,
    pub workflow_details: BTreeMap<String, WorkflowStats>,
}

impl std::fmt::Display for PlannerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Workflow Planning ===")?;
        writeln!(f, "Workflows: {}", self.workflows_optimized)?;
        writeln!(
            f,
            "Steps: {} -> {} ({:.1}% fewer)",
            self.total_original_steps, self.total_optimized_steps, self.total_reduction_percentage
        )?;
        writeln!(f, "Calls saved: {}", self.total_api_calls_saved)
    }
}

fn reduction(original: usize, optimized: usize) -> f64 {
    if original == 0 {
        return 0.0;
    }
    original.saturating_sub(optimized) as f64 / original as f64 * 100.0
}

/// Greedy merger of adjacent compatible workflow steps
#[derive(Debug, Default)]
pub struct WorkflowStepPlanner {
    settings: WorkflowSettings,
    stats: Mutex<BTreeMap<String, WorkflowStats>>,
}

impl WorkflowStepPlanner {
    pub fn new(settings: WorkflowSettings) -> Self {
        Self {
            settings,
            stats: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    fn stats_lock(&self) -> MutexGuard<'_, BTreeMap<String, WorkflowStats>> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether two neighbouring steps may share one call
    pub fn can_merge(&self, first: &WorkflowStep, second: &WorkflowStep) -> bool {
        let (a, b) = (first.task_name.as_str(), second.task_name.as_str());

        let paired = self
            .settings
            .mergeable_pairs
            .iter()
            .any(|[x, y]| (a == x && b == y) || (a == y && b == x));
        if paired {
            return true;
        }

        let low = &self.settings.low_complexity_tasks;
        low.iter().any(|t| t == a) && low.iter().any(|t| t == b)
    }

    /// Single left-to-right pass; each step is compared with the input step
    /// right before it, never with an earlier one.
    pub fn merge(&self, steps: &[WorkflowStep]) -> Vec<WorkflowStep> {
        let Some((first, rest)) = steps.split_first() else {
            return Vec::new();
        };

        let mut merged = Vec::with_capacity(steps.len());
        let mut group = vec![first];

        for (previous, current) in steps.iter().zip(rest) {
            if self.can_merge(previous, current) {
                group.push(current);
            } else {
                merged.push(self.close_group(&group));
                group = vec![current];
            }
        }
        merged.push(self.close_group(&group));

        merged
    }

    fn close_group(&self, group: &[&WorkflowStep]) -> WorkflowStep {
        if let [single] = group {
            return (*single).clone();
        }

        let names: Vec<String> = group.iter().map(|s| s.task_name.clone()).collect();
        let descriptions: Vec<&str> = group.iter().map(|s| s.description.as_str()).collect();

        let step = WorkflowStep {
            task_name: names.join(&self.settings.task_separator),
            description: descriptions.join(&self.settings.description_separator),
            is_merged: true,
            source_task_names: names,
            complexity: None,
            provider_preference: None,
        };
        debug!("Merged {} steps into '{}'", group.len(), step.task_name);
        step
    }

    /// Copy of `steps` with complexity and provider preference filled in
    pub fn annotate(&self, steps: &[WorkflowStep]) -> Vec<WorkflowStep> {
        let separator = &self.settings.task_separator;
        steps
            .iter()
            .map(|step| WorkflowStep {
                complexity: Some(classify(&step.task_name, separator)),
                provider_preference: preferred_provider(
                    &step.task_name,
                    separator,
                    self.settings.economic_mode,
                )
                .map(str::to_string),
                ..step.clone()
            })
            .collect()
    }

    /// Merge and annotate the steps of workflow `name`, recording its stats
    pub fn plan(&self, name: &str, steps: &[WorkflowStep]) -> Vec<WorkflowStep> {
        let planned = self.annotate(&self.merge(steps));
        let stats = WorkflowStats::new(steps.len(), planned.len());

        info!(
            "Workflow '{}' planned: {} -> {} steps ({:.1}% reduction)",
            name, stats.original_steps, stats.optimized_steps, stats.reduction_percentage
        );
        self.stats_lock().insert(name.to_string(), stats);
        planned
    }

    /// Stats for one planned workflow
    pub fn workflow_stats(&self, name: &str) -> Option<WorkflowStats> {
        self.stats_lock().get(name).copied()
    }

    pub fn stats(&self) -> PlannerStats {
        let details = self.stats_lock().clone();
        let total_original_steps = details.values().map(|s| s.original_steps).sum();
        let total_optimized_steps = details.values().map(|s| s.optimized_steps).sum();

        PlannerStats {
            workflows_optimized: details.len(),
            total_original_steps,
            total_optimized_steps,
            total_reduction_percentage: reduction(total_original_steps, total_optimized_steps),
            total_api_calls_saved: details.values().map(|s| s.estimated_api_calls_saved).sum(),
            workflow_details: details,
        }
    }
}
