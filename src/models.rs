use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed skill domain used across snapshots, trajectories and decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Skill {
    Grammar,
    Vocabulary,
    Reading,
    Listening,
    Writing,
    Speaking,
}

impl Skill {
    pub const ALL: [Skill; 6] = [
        Skill::Grammar,
        Skill::Vocabulary,
        Skill::Reading,
        Skill::Listening,
        Skill::Writing,
        Skill::Speaking,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Skill::Grammar => "grammar",
            Skill::Vocabulary => "vocabulary",
            Skill::Reading => "reading",
            Skill::Listening => "listening",
            Skill::Writing => "writing",
            Skill::Speaking => "speaking",
        }
    }

    pub fn parse(value: &str) -> Option<Skill> {
        let normalized = value.trim().to_lowercase();
        Skill::ALL
            .into_iter()
            .find(|skill| skill.as_str() == normalized)
    }
}

/// One skill's measured performance on one task, produced externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillScore {
    pub skill: Skill,
    pub score: Option<f64>,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Scored,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scored => "scored",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<TaskStatus> {
        match value {
            "scored" => Some(TaskStatus::Scored),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Assessment results for one answered task in a lesson attempt.
#[derive(Debug, Clone)]
pub struct TaskAssessment {
    pub task_key: String,
    pub status: TaskStatus,
    pub scores: Vec<SkillScore>,
    pub error_tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotContext {
    PreLesson,
    PostLesson,
}

impl SnapshotContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotContext::PreLesson => "PRE_LESSON",
            SnapshotContext::PostLesson => "POST_LESSON",
        }
    }
}

/// Point-in-time record of a student's per-skill levels. Written once per
/// evaluation and retained for audit.
#[derive(Debug, Clone)]
pub struct SkillSnapshot {
    pub id: Uuid,
    pub student_id: Uuid,
    pub enrollment_id: Uuid,
    pub lesson_id: Uuid,
    pub context: SnapshotContext,
    pub skills: BTreeMap<Skill, f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub at: DateTime<Utc>,
    pub value: f64,
}

/// Longitudinal model of one skill for one student. `trend` is an OLS slope
/// clamped to [-0.5, 0.5]; `stability` sits in [0.2, 1.0] after a historical
/// recompute and is floored at 0.3 by the incremental decay.
#[derive(Debug, Clone)]
pub struct SkillTrajectory {
    pub student_id: Uuid,
    pub skill: Skill,
    pub trend: f64,
    pub stability: f64,
    pub history: Vec<TrajectoryPoint>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

/// Change between the pre- and post-lesson snapshots of one evaluation.
#[derive(Debug, Clone)]
pub struct SkillDelta {
    pub pre_snapshot_id: Uuid,
    pub post_snapshot_id: Uuid,
    pub deltas: BTreeMap<Skill, f64>,
    pub overall_delta: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionCode {
    AdvanceLesson,
    CompleteCourse,
    RepeatLesson,
    AdaptiveRepeatLesson,
}

impl DecisionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionCode::AdvanceLesson => "ADVANCE_LESSON",
            DecisionCode::CompleteCourse => "COMPLETE_COURSE",
            DecisionCode::RepeatLesson => "REPEAT_LESSON",
            DecisionCode::AdaptiveRepeatLesson => "ADAPTIVE_REPEAT_LESSON",
        }
    }

    pub fn parse(value: &str) -> Option<DecisionCode> {
        match value {
            "ADVANCE_LESSON" => Some(DecisionCode::AdvanceLesson),
            "COMPLETE_COURSE" => Some(DecisionCode::CompleteCourse),
            "REPEAT_LESSON" => Some(DecisionCode::RepeatLesson),
            "ADAPTIVE_REPEAT_LESSON" => Some(DecisionCode::AdaptiveRepeatLesson),
            _ => None,
        }
    }
}

/// The engine's verdict for one lesson-completion event. Transient; persisted
/// only through the transition record.
#[derive(Debug, Clone)]
pub struct Decision {
    pub code: DecisionCode,
    pub confidence: f64,
    pub rationale: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentStatus {
    Open,
    InProgress,
    Completed,
    AssessmentError,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Open => "OPEN",
            EnrollmentStatus::InProgress => "IN_PROGRESS",
            EnrollmentStatus::Completed => "COMPLETED",
            EnrollmentStatus::AssessmentError => "ASSESSMENT_ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<EnrollmentStatus> {
        match value {
            "OPEN" => Some(EnrollmentStatus::Open),
            "IN_PROGRESS" => Some(EnrollmentStatus::InProgress),
            "COMPLETED" => Some(EnrollmentStatus::Completed),
            "ASSESSMENT_ERROR" => Some(EnrollmentStatus::AssessmentError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Enrollment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub current_lesson_id: Uuid,
    pub status: EnrollmentStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub active_job_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct Lesson {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub lesson_order: i32,
    pub active: bool,
    pub target_skills: Vec<Skill>,
    pub remedial: bool,
}

/// Human correction of a prior decision. Read-only to the engine; the
/// overridden code is validated at decision time, not at write time.
#[derive(Debug, Clone)]
pub struct TeacherOverride {
    pub id: Uuid,
    pub student_id: Uuid,
    pub lesson_id: Uuid,
    pub original_decision: String,
    pub overridden_decision: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit entry: the sole source of truth for what happened and why.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub from_lesson_id: Uuid,
    pub to_lesson_id: Option<Uuid>,
    pub decision_code: DecisionCode,
    pub confidence: f64,
    pub rationale: serde_json::Value,
    pub snapshot_id: Uuid,
    pub override_applied: bool,
    pub override_id: Option<Uuid>,
    pub override_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Completed,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Completed => "COMPLETED",
            JobState::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<JobState> {
        match value {
            "PENDING" => Some(JobState::Pending),
            "COMPLETED" => Some(JobState::Completed),
            "ERROR" => Some(JobState::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub state: JobState,
    pub progress_estimate: f64,
    pub decision_code: Option<String>,
    pub error: Option<String>,
}
