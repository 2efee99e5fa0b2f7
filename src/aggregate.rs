use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::error::EngineError;
use crate::models::{Skill, TaskAssessment, TaskStatus};

/// Per-skill result of reducing one lesson attempt's task assessments.
#[derive(Debug, Clone)]
pub struct AggregateOutcome {
    pub scores: BTreeMap<Skill, f64>,
    pub error_tags: BTreeSet<String>,
    pub scored_tasks: usize,
    pub failed_tasks: usize,
}

/// Reduce per-task skill scores into one aggregated score per skill, blended
/// against the student's current level. Weaker skills weight new evidence
/// more heavily: `w = 0.3 + 0.7 * (1 - current_level)`.
///
/// Failed tasks are skipped and counted; a batch in which every task failed
/// is fatal for the evaluation.
pub fn aggregate(
    tasks: &[TaskAssessment],
    profile: &BTreeMap<Skill, f64>,
) -> Result<AggregateOutcome, EngineError> {
    let mut observed: BTreeMap<Skill, Vec<f64>> = BTreeMap::new();
    let mut error_tags = BTreeSet::new();
    let mut scored_tasks = 0usize;
    let mut failed_tasks = 0usize;

    for task in tasks {
        for tag in &task.error_tags {
            error_tags.insert(tag.clone());
        }
        if task.status == TaskStatus::Failed {
            failed_tasks += 1;
            continue;
        }
        scored_tasks += 1;

        for skill_score in &task.scores {
            if let Some(score) = skill_score.score {
                observed
                    .entry(skill_score.skill)
                    .or_default()
                    .push(score.clamp(0.0, 1.0));
            }
        }
    }

    if failed_tasks > 0 {
        warn!(
            failed = failed_tasks,
            scored = scored_tasks,
            "skipped unscored tasks in assessment batch"
        );
    }
    if scored_tasks == 0 {
        return Err(EngineError::AllTasksFailed);
    }

    let mut scores = profile.clone();
    for (skill, values) in observed {
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        let current = profile.get(&skill).copied().unwrap_or(0.0);
        let weight = 0.3 + 0.7 * (1.0 - current);
        let aggregated = current * (1.0 - weight) + avg * weight;
        scores.insert(skill, aggregated.clamp(0.0, 1.0));
    }

    Ok(AggregateOutcome {
        scores,
        error_tags,
        scored_tasks,
        failed_tasks,
    })
}
