use std::time::{Duration, Instant};

use sqlx::{PgPool, Row};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{self, PgStore};
use crate::error::EngineError;
use crate::evaluate;
use crate::models::{JobState, JobStatus};

/// Elapsed time after which a finished evaluation is logged as slow.
const SOFT_BUDGET: Duration = Duration::from_secs(20);
/// Evaluations running past this are aborted and rolled back.
const HARD_BUDGET: Duration = Duration::from_secs(60);

/// Queue one evaluation for (enrollment, lesson). At most one job may be in
/// flight per enrollment: the job id is recorded on the enrollment row and
/// re-submission is rejected until it clears.
pub async fn submit(
    pool: &PgPool,
    enrollment_id: Uuid,
    lesson_id: Uuid,
) -> Result<Uuid, EngineError> {
    let job_id = Uuid::new_v4();

    // Claim and job row must land together: a claim pointing at a job that
    // was never inserted would block the enrollment forever.
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query(
        "UPDATE adaptive_progression.enrollments \
         SET active_job_id = $1 WHERE id = $2 AND active_job_id IS NULL",
    )
    .bind(job_id)
    .bind(enrollment_id)
    .execute(&mut *tx)
    .await?;

    if claimed.rows_affected() == 0 {
        let row = sqlx::query(
            "SELECT active_job_id FROM adaptive_progression.enrollments WHERE id = $1",
        )
        .bind(enrollment_id)
        .fetch_optional(&mut *tx)
        .await?;
        return match row {
            None => Err(EngineError::EnrollmentNotFound(enrollment_id)),
            Some(row) => {
                let in_flight: Option<Uuid> = row.get("active_job_id");
                Err(EngineError::JobInFlight {
                    enrollment_id,
                    job_id: in_flight.unwrap_or(Uuid::nil()),
                })
            }
        };
    }

    sqlx::query(
        "INSERT INTO adaptive_progression.evaluation_jobs (id, enrollment_id, lesson_id) \
         VALUES ($1, $2, $3)",
    )
    .bind(job_id)
    .bind(enrollment_id)
    .bind(lesson_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(%job_id, %enrollment_id, %lesson_id, "evaluation job submitted");
    Ok(job_id)
}

/// Execute one submitted job. The evaluation runs inside one transaction
/// under a hard time budget; on any failure the transaction is dropped, the
/// job is marked ERROR and the enrollment is flagged ASSESSMENT_ERROR for
/// operator retry.
pub async fn run(pool: &PgPool, job_id: Uuid) -> Result<JobStatus, EngineError> {
    // Atomic claim: only the worker that flips started_at runs the job, so
    // two workers racing on the same id produce one evaluation, not two.
    let row = sqlx::query(
        "UPDATE adaptive_progression.evaluation_jobs SET started_at = now() \
         WHERE id = $1 AND status = 'PENDING' AND started_at IS NULL \
         RETURNING enrollment_id, lesson_id",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return poll(pool, job_id).await;
    };
    let enrollment_id: Uuid = row.get("enrollment_id");
    let lesson_id: Uuid = row.get("lesson_id");

    let started = Instant::now();
    let result = tokio::time::timeout(HARD_BUDGET, execute(pool, enrollment_id, lesson_id)).await;
    let elapsed = started.elapsed();
    if elapsed > SOFT_BUDGET {
        warn!(%job_id, ?elapsed, "evaluation exceeded its soft time budget");
    }

    match result {
        Ok(Ok(code)) => {
            sqlx::query(
                "UPDATE adaptive_progression.evaluation_jobs \
                 SET status = 'COMPLETED', decision_code = $1, finished_at = now() \
                 WHERE id = $2",
            )
            .bind(&code)
            .bind(job_id)
            .execute(pool)
            .await?;
            info!(%job_id, code = %code, "evaluation job completed");
        }
        Ok(Err(err)) => {
            error!(%job_id, %err, "evaluation job failed");
            fail(pool, job_id, enrollment_id, &err.to_string()).await?;
        }
        Err(_) => {
            let err = EngineError::TimeBudgetExceeded;
            error!(%job_id, %err, "evaluation job aborted");
            fail(pool, job_id, enrollment_id, &err.to_string()).await?;
        }
    }

    poll(pool, job_id).await
}

async fn execute(
    pool: &PgPool,
    enrollment_id: Uuid,
    lesson_id: Uuid,
) -> Result<String, EngineError> {
    let store = PgStore::new(pool.clone());
    let inputs = evaluate::gather(&store, enrollment_id, lesson_id).await?;
    let outcome = evaluate::evaluate(inputs)?;

    if outcome.failed_tasks > 0 {
        warn!(
            failed = outcome.failed_tasks,
            "evaluation proceeded with unscored tasks"
        );
    }
    let transition = &outcome.transition;
    info!(
        restart = transition.restart_required,
        completed = transition.completed,
        next_lesson = ?transition.next_lesson_id,
        focus = ?transition.focus_skills,
        marker = ?transition.marker,
        "decision applied to enrollment"
    );

    let mut tx = pool.begin().await?;
    db::persist_outcome(&mut tx, &outcome).await?;
    tx.commit().await?;

    Ok(outcome.decision.code.as_str().to_string())
}

async fn fail(
    pool: &PgPool,
    job_id: Uuid,
    enrollment_id: Uuid,
    message: &str,
) -> Result<(), EngineError> {
    sqlx::query(
        "UPDATE adaptive_progression.evaluation_jobs \
         SET status = 'ERROR', error = $1, finished_at = now() WHERE id = $2",
    )
    .bind(message)
    .bind(job_id)
    .execute(pool)
    .await?;
    db::mark_assessment_error(pool, enrollment_id).await
}

pub async fn poll(pool: &PgPool, job_id: Uuid) -> Result<JobStatus, EngineError> {
    let row = sqlx::query(
        "SELECT status, decision_code, error, started_at \
         FROM adaptive_progression.evaluation_jobs WHERE id = $1",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Err(EngineError::JobNotFound(job_id));
    };

    let status: String = row.get("status");
    let state = JobState::parse(&status).unwrap_or(JobState::Pending);
    let started: Option<chrono::DateTime<chrono::Utc>> = row.get("started_at");
    let progress_estimate = match state {
        JobState::Pending if started.is_none() => 0.0,
        JobState::Pending => 0.5,
        JobState::Completed | JobState::Error => 1.0,
    };

    Ok(JobStatus {
        job_id,
        state,
        progress_estimate,
        decision_code: row.get("decision_code"),
        error: row.get("error"),
    })
}

/// Drain pending jobs oldest-first until the queue is empty. Jobs run one
/// at a time; snapshot ordering per student must stay consistent, and the
/// per-enrollment claim already forbids overlap anyway.
pub async fn drain(pool: &PgPool) -> Result<usize, EngineError> {
    let mut processed = 0usize;
    loop {
        let row = sqlx::query(
            "SELECT id FROM adaptive_progression.evaluation_jobs \
             WHERE status = 'PENDING' AND started_at IS NULL \
             ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(pool)
        .await?;
        let Some(row) = row else {
            break;
        };
        let job_id: Uuid = row.get("id");
        run(pool, job_id).await?;
        processed += 1;
    }
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    async fn test_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must point at a test Postgres instance");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .expect("failed to connect to Postgres");
        crate::db::init_db(&pool).await.expect("migrations failed");
        pool
    }

    /// One student mid-course with two lessons and a scored task batch on
    /// the first, all under fresh ids so runs never interfere.
    async fn fixture(pool: &PgPool) -> (Uuid, Uuid) {
        let student_id = Uuid::new_v4();
        let course_id = Uuid::new_v4();
        let lesson_one = Uuid::new_v4();
        let lesson_two = Uuid::new_v4();
        let enrollment_id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO adaptive_progression.students (id, full_name, email) \
             VALUES ($1, $2, $3)",
        )
        .bind(student_id)
        .bind("Test Student")
        .bind(format!("student-{student_id}@example.com"))
        .execute(pool)
        .await
        .unwrap();

        sqlx::query("INSERT INTO adaptive_progression.courses (id, title) VALUES ($1, $2)")
            .bind(course_id)
            .bind("Test Course")
            .execute(pool)
            .await
            .unwrap();

        for (lesson_id, order) in [(lesson_one, 1), (lesson_two, 2)] {
            sqlx::query(
                "INSERT INTO adaptive_progression.lessons \
                 (id, course_id, title, lesson_order) VALUES ($1, $2, $3, $4)",
            )
            .bind(lesson_id)
            .bind(course_id)
            .bind(format!("Lesson {order}"))
            .bind(order)
            .execute(pool)
            .await
            .unwrap();
        }

        for skill in ["grammar", "vocabulary"] {
            sqlx::query(
                "INSERT INTO adaptive_progression.skill_profiles (student_id, skill, level) \
                 VALUES ($1, $2, 0.6)",
            )
            .bind(student_id)
            .bind(skill)
            .execute(pool)
            .await
            .unwrap();
        }

        sqlx::query(
            "INSERT INTO adaptive_progression.enrollments \
             (id, student_id, course_id, current_lesson_id, status) \
             VALUES ($1, $2, $3, $4, 'IN_PROGRESS')",
        )
        .bind(enrollment_id)
        .bind(student_id)
        .bind(course_id)
        .bind(lesson_one)
        .execute(pool)
        .await
        .unwrap();

        let scores = serde_json::json!([
            { "skill": "grammar", "score": 0.85, "confidence": 0.9, "evidence": [] },
            { "skill": "vocabulary", "score": 0.85, "confidence": 0.9, "evidence": [] }
        ]);
        sqlx::query(
            "INSERT INTO adaptive_progression.task_assessments \
             (id, enrollment_id, lesson_id, task_key, status, scores) \
             VALUES ($1, $2, $3, 'task-1', 'scored', $4)",
        )
        .bind(Uuid::new_v4())
        .bind(enrollment_id)
        .bind(lesson_one)
        .bind(&scores)
        .execute(pool)
        .await
        .unwrap();

        (enrollment_id, lesson_one)
    }

    #[tokio::test]
    #[ignore = "needs a live Postgres via DATABASE_URL"]
    async fn failed_submit_releases_the_enrollment_claim() {
        let pool = test_pool().await;
        let (enrollment_id, lesson_id) = fixture(&pool).await;

        // Unknown lesson violates the job row's foreign key mid-submit; the
        // enrollment claim from the same submit must roll back with it.
        let err = submit(&pool, enrollment_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Db(_)));

        let row = sqlx::query(
            "SELECT active_job_id FROM adaptive_progression.enrollments WHERE id = $1",
        )
        .bind(enrollment_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        let claim: Option<Uuid> = row.get("active_job_id");
        assert_eq!(claim, None);

        // And the enrollment stays eligible for evaluation.
        let job_id = submit(&pool, enrollment_id, lesson_id).await.unwrap();
        let status = poll(&pool, job_id).await.unwrap();
        assert_eq!(status.state, JobState::Pending);
    }

    #[tokio::test]
    #[ignore = "needs a live Postgres via DATABASE_URL"]
    async fn competing_runs_record_one_transition() {
        let pool = test_pool().await;
        let (enrollment_id, lesson_id) = fixture(&pool).await;
        let job_id = submit(&pool, enrollment_id, lesson_id).await.unwrap();

        // Two workers picking up the same job id: only the one that wins
        // the started_at claim may evaluate. The loser reports job status
        // as of that moment, which may still be in flight.
        let (a, b) = tokio::join!(run(&pool, job_id), run(&pool, job_id));
        a.unwrap();
        b.unwrap();
        assert_eq!(poll(&pool, job_id).await.unwrap().state, JobState::Completed);

        let row = sqlx::query(
            "SELECT count(*) AS n FROM adaptive_progression.transition_records \
             WHERE enrollment_id = $1",
        )
        .bind(enrollment_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        let transitions: i64 = row.get("n");
        assert_eq!(transitions, 1);
    }

    #[tokio::test]
    #[ignore = "needs a live Postgres via DATABASE_URL"]
    async fn polling_an_unknown_job_is_a_named_error() {
        let pool = test_pool().await;
        let missing = Uuid::new_v4();
        let err = poll(&pool, missing).await.unwrap_err();
        assert!(matches!(err, EngineError::JobNotFound(id) if id == missing));
    }
}
