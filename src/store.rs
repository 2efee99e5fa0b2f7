use std::collections::BTreeMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    Enrollment, Lesson, Skill, SkillSnapshot, SkillTrajectory, TaskAssessment, TeacherOverride,
};

/// Read side of the progression engine. The decision and trajectory logic
/// depends only on this trait; Postgres is one implementation of it.
#[async_trait]
pub trait ProgressionStore: Send + Sync {
    async fn enrollment(&self, id: Uuid) -> Result<Option<Enrollment>, EngineError>;

    async fn lesson(&self, id: Uuid) -> Result<Option<Lesson>, EngineError>;

    /// Next active lesson in the course, ordered by `lesson_order` after the
    /// given position. `None` means the course has no further lesson.
    async fn next_active_lesson(
        &self,
        course_id: Uuid,
        after_order: i32,
    ) -> Result<Option<Lesson>, EngineError>;

    /// Most recent override for (student, lesson), by creation time.
    async fn active_override(
        &self,
        student_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<Option<TeacherOverride>, EngineError>;

    async fn skill_profile(&self, student_id: Uuid) -> Result<BTreeMap<Skill, f64>, EngineError>;

    async fn task_assessments(
        &self,
        enrollment_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<Vec<TaskAssessment>, EngineError>;

    async fn trajectories(
        &self,
        student_id: Uuid,
    ) -> Result<BTreeMap<Skill, SkillTrajectory>, EngineError>;

    /// Post-lesson snapshots for one student, oldest first. Feeds the
    /// periodic historical trajectory recompute.
    async fn snapshot_history(
        &self,
        student_id: Uuid,
    ) -> Result<Vec<SkillSnapshot>, EngineError>;
}
