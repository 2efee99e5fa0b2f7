use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::aggregate;
use crate::audit;
use crate::decision::{self, DecisionInputs};
use crate::error::EngineError;
use crate::models::{
    Decision, Enrollment, Lesson, Skill, SkillDelta, SkillSnapshot, SkillTrajectory,
    SnapshotContext, TaskAssessment, TeacherOverride, TransitionRecord,
};
use crate::progression::{self, Transition};
use crate::store::ProgressionStore;
use crate::trajectory;

/// Everything one lesson evaluation reads, gathered up front so the core
/// stays pure and replayable.
#[derive(Debug, Clone)]
pub struct EvaluationInputs {
    pub enrollment: Enrollment,
    pub lesson: Lesson,
    pub next_lesson: Option<Lesson>,
    pub tasks: Vec<TaskAssessment>,
    pub profile: BTreeMap<Skill, f64>,
    pub active_override: Option<TeacherOverride>,
    pub trajectories: BTreeMap<Skill, SkillTrajectory>,
    pub now: DateTime<Utc>,
}

/// Everything one lesson evaluation writes. Persisted atomically or not at
/// all.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub pre_snapshot: SkillSnapshot,
    pub post_snapshot: SkillSnapshot,
    pub delta: SkillDelta,
    pub trajectories: Vec<SkillTrajectory>,
    pub decision: Decision,
    pub enrollment: Enrollment,
    pub transition: Transition,
    pub record: TransitionRecord,
    pub failed_tasks: usize,
}

/// Fetch the inputs for one (enrollment, lesson) evaluation through the
/// store trait.
pub async fn gather<S: ProgressionStore + ?Sized>(
    store: &S,
    enrollment_id: Uuid,
    lesson_id: Uuid,
) -> Result<EvaluationInputs, EngineError> {
    let enrollment = store
        .enrollment(enrollment_id)
        .await?
        .ok_or(EngineError::EnrollmentNotFound(enrollment_id))?;
    let lesson = store
        .lesson(lesson_id)
        .await?
        .ok_or(EngineError::LessonNotFound(lesson_id))?;
    let next_lesson = store
        .next_active_lesson(lesson.course_id, lesson.lesson_order)
        .await?;
    let tasks = store.task_assessments(enrollment_id, lesson_id).await?;
    let profile = store.skill_profile(enrollment.student_id).await?;
    let active_override = store
        .active_override(enrollment.student_id, lesson_id)
        .await?;
    let trajectories = store.trajectories(enrollment.student_id).await?;

    Ok(EvaluationInputs {
        enrollment,
        lesson,
        next_lesson,
        tasks,
        profile,
        active_override,
        trajectories,
        now: Utc::now(),
    })
}

/// Run the full pipeline for one lesson-completion event: aggregate task
/// scores, fold the new snapshot into each skill trajectory, decide, apply
/// the decision to the enrollment, and build the audit record.
pub fn evaluate(inputs: EvaluationInputs) -> Result<EvaluationOutcome, EngineError> {
    if inputs.tasks.is_empty() {
        return Err(EngineError::EmptyBatch {
            enrollment_id: inputs.enrollment.id,
            lesson_id: inputs.lesson.id,
        });
    }

    let aggregated = aggregate::aggregate(&inputs.tasks, &inputs.profile)?;

    let pre_snapshot = SkillSnapshot {
        id: Uuid::new_v4(),
        student_id: inputs.enrollment.student_id,
        enrollment_id: inputs.enrollment.id,
        lesson_id: inputs.lesson.id,
        context: SnapshotContext::PreLesson,
        skills: inputs.profile.clone(),
        created_at: inputs.now,
    };
    let post_snapshot = SkillSnapshot {
        id: Uuid::new_v4(),
        student_id: inputs.enrollment.student_id,
        enrollment_id: inputs.enrollment.id,
        lesson_id: inputs.lesson.id,
        context: SnapshotContext::PostLesson,
        skills: aggregated.scores.clone(),
        created_at: inputs.now,
    };

    let mut deltas = BTreeMap::new();
    for (skill, post) in &post_snapshot.skills {
        let pre = pre_snapshot.skills.get(skill).copied().unwrap_or(0.0);
        deltas.insert(*skill, post - pre);
    }
    let overall_delta = if deltas.is_empty() {
        0.0
    } else {
        deltas.values().sum::<f64>() / deltas.len() as f64
    };
    let delta = SkillDelta {
        pre_snapshot_id: pre_snapshot.id,
        post_snapshot_id: post_snapshot.id,
        deltas: deltas.clone(),
        overall_delta,
    };

    let mut trajectories = Vec::with_capacity(post_snapshot.skills.len());
    for (skill, value) in &post_snapshot.skills {
        let mut t = inputs
            .trajectories
            .get(skill)
            .cloned()
            .unwrap_or_else(|| trajectory::new_trajectory(inputs.enrollment.student_id, *skill));
        trajectory::apply_snapshot(&mut t, inputs.now, *value);
        trajectories.push(t);
    }

    let decision = decision::decide(&DecisionInputs {
        aggregated: &post_snapshot.skills,
        deltas: &deltas,
        baseline: &pre_snapshot.skills,
        error_tags: &aggregated.error_tags,
        target_skills: &inputs.lesson.target_skills,
        active_override: inputs.active_override.as_ref(),
        has_next_lesson: inputs.next_lesson.is_some(),
    });

    let mut enrollment = inputs.enrollment.clone();
    let transition = progression::apply(
        &mut enrollment,
        &decision,
        inputs.next_lesson.as_ref(),
        inputs.now,
    )?;

    let record = audit::build_record(
        enrollment.id,
        inputs.lesson.id,
        inputs.next_lesson.as_ref(),
        &decision,
        post_snapshot.id,
        inputs.active_override.as_ref(),
        inputs.now,
    );

    Ok(EvaluationOutcome {
        pre_snapshot,
        post_snapshot,
        delta,
        trajectories,
        decision,
        enrollment,
        transition,
        record,
        failed_tasks: aggregated.failed_tasks,
    })
}

/// Rebuild per-skill trajectories from stored post-lesson snapshots: the
/// periodic historical pass. Requires at least three snapshots; returns the
/// trajectories that actually changed.
pub fn recompute_from_history(
    student_id: Uuid,
    snapshots: &[SkillSnapshot],
    current: &BTreeMap<Skill, SkillTrajectory>,
) -> Vec<SkillTrajectory> {
    if snapshots.len() < 3 {
        return Vec::new();
    }

    let mut updated = Vec::new();
    for skill in Skill::ALL {
        let points: Vec<(DateTime<Utc>, f64)> = snapshots
            .iter()
            .filter_map(|s| s.skills.get(&skill).map(|v| (s.created_at, *v)))
            .collect();
        if points.len() < 3 {
            continue;
        }

        let mut t = current
            .get(&skill)
            .cloned()
            .unwrap_or_else(|| trajectory::new_trajectory(student_id, skill));
        t.history = points
            .iter()
            .rev()
            .take(trajectory::HISTORY_WINDOW)
            .rev()
            .map(|(at, value)| crate::models::TrajectoryPoint { at: *at, value: *value })
            .collect();
        if trajectory::recompute(&mut t) {
            t.last_snapshot_at = points.last().map(|(at, _)| *at);
            updated.push(t);
        }
    }
    updated
}
