use uuid::Uuid;

/// Error taxonomy for one lesson evaluation.
///
/// Validation problems never abort an evaluation; they resolve into the
/// fallback decision inside the rule cascade. Everything in this enum is a
/// hard failure: the enclosing transaction rolls back and the enrollment is
/// flagged `ASSESSMENT_ERROR`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no task in the batch produced a usable score")]
    AllTasksFailed,

    #[error("no assessed tasks found for enrollment {enrollment_id} lesson {lesson_id}")]
    EmptyBatch {
        enrollment_id: Uuid,
        lesson_id: Uuid,
    },

    #[error("advance decided but no next active lesson exists for enrollment {0}")]
    MissingNextLesson(Uuid),

    #[error("enrollment {0} not found")]
    EnrollmentNotFound(Uuid),

    #[error("lesson {0} not found")]
    LessonNotFound(Uuid),

    #[error("enrollment {enrollment_id} already has evaluation job {job_id} in flight")]
    JobInFlight {
        enrollment_id: Uuid,
        job_id: Uuid,
    },

    #[error("evaluation job {0} not found")]
    JobNotFound(Uuid),

    #[error("evaluation job exceeded its time budget and was aborted")]
    TimeBudgetExceeded,

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
