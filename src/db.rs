use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::EngineError;
use crate::evaluate::EvaluationOutcome;
use crate::models::{
    Enrollment, EnrollmentStatus, Lesson, Skill, SkillSnapshot, SkillTrajectory, SnapshotContext,
    TaskAssessment, TaskStatus, TeacherOverride, TransitionRecord,
};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed read side of the engine.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn lesson_from_row(row: &sqlx::postgres::PgRow) -> Lesson {
    let raw_skills: Vec<String> = row.get("target_skills");
    Lesson {
        id: row.get("id"),
        course_id: row.get("course_id"),
        title: row.get("title"),
        lesson_order: row.get("lesson_order"),
        active: row.get("active"),
        target_skills: raw_skills.iter().filter_map(|s| Skill::parse(s)).collect(),
        remedial: row.get("remedial"),
    }
}

fn enrollment_from_row(row: &sqlx::postgres::PgRow) -> Enrollment {
    let status: String = row.get("status");
    Enrollment {
        id: row.get("id"),
        student_id: row.get("student_id"),
        course_id: row.get("course_id"),
        current_lesson_id: row.get("current_lesson_id"),
        status: EnrollmentStatus::parse(&status).unwrap_or(EnrollmentStatus::Open),
        completed_at: row.get("completed_at"),
        active_job_id: row.get("active_job_id"),
    }
}

#[async_trait]
impl crate::store::ProgressionStore for PgStore {
    async fn enrollment(&self, id: Uuid) -> Result<Option<Enrollment>, EngineError> {
        let row = sqlx::query(
            "SELECT id, student_id, course_id, current_lesson_id, status, completed_at, \
             active_job_id FROM adaptive_progression.enrollments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(enrollment_from_row))
    }

    async fn lesson(&self, id: Uuid) -> Result<Option<Lesson>, EngineError> {
        let row = sqlx::query(
            "SELECT id, course_id, title, lesson_order, active, target_skills, remedial \
             FROM adaptive_progression.lessons WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(lesson_from_row))
    }

    async fn next_active_lesson(
        &self,
        course_id: Uuid,
        after_order: i32,
    ) -> Result<Option<Lesson>, EngineError> {
        let row = sqlx::query(
            "SELECT id, course_id, title, lesson_order, active, target_skills, remedial \
             FROM adaptive_progression.lessons \
             WHERE course_id = $1 AND active AND lesson_order > $2 \
             ORDER BY lesson_order ASC LIMIT 1",
        )
        .bind(course_id)
        .bind(after_order)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(lesson_from_row))
    }

    async fn active_override(
        &self,
        student_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<Option<TeacherOverride>, EngineError> {
        let row = sqlx::query(
            "SELECT id, student_id, lesson_id, original_decision, overridden_decision, \
             reason, created_at \
             FROM adaptive_progression.teacher_overrides \
             WHERE student_id = $1 AND lesson_id = $2 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(student_id)
        .bind(lesson_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| TeacherOverride {
            id: row.get("id"),
            student_id: row.get("student_id"),
            lesson_id: row.get("lesson_id"),
            original_decision: row.get("original_decision"),
            overridden_decision: row.get("overridden_decision"),
            reason: row.get("reason"),
            created_at: row.get("created_at"),
        }))
    }

    async fn skill_profile(&self, student_id: Uuid) -> Result<BTreeMap<Skill, f64>, EngineError> {
        let rows = sqlx::query(
            "SELECT skill, level FROM adaptive_progression.skill_profiles WHERE student_id = $1",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        let mut profile = BTreeMap::new();
        for row in rows {
            let skill: String = row.get("skill");
            if let Some(skill) = Skill::parse(&skill) {
                profile.insert(skill, row.get::<f64, _>("level"));
            }
        }
        Ok(profile)
    }

    async fn task_assessments(
        &self,
        enrollment_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<Vec<TaskAssessment>, EngineError> {
        let rows = sqlx::query(
            "SELECT task_key, status, scores, error_tags \
             FROM adaptive_progression.task_assessments \
             WHERE enrollment_id = $1 AND lesson_id = $2 \
             ORDER BY created_at ASC",
        )
        .bind(enrollment_id)
        .bind(lesson_id)
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            let scores: serde_json::Value = row.get("scores");
            tasks.push(TaskAssessment {
                task_key: row.get("task_key"),
                status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
                scores: serde_json::from_value(scores)?,
                error_tags: row.get("error_tags"),
            });
        }
        Ok(tasks)
    }

    async fn trajectories(
        &self,
        student_id: Uuid,
    ) -> Result<BTreeMap<Skill, SkillTrajectory>, EngineError> {
        let rows = sqlx::query(
            "SELECT skill, trend, stability, history, last_snapshot_at \
             FROM adaptive_progression.skill_trajectories WHERE student_id = $1",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        let mut trajectories = BTreeMap::new();
        for row in rows {
            let skill: String = row.get("skill");
            let Some(skill) = Skill::parse(&skill) else {
                continue;
            };
            let history: serde_json::Value = row.get("history");
            trajectories.insert(
                skill,
                SkillTrajectory {
                    student_id,
                    skill,
                    trend: row.get("trend"),
                    stability: row.get("stability"),
                    history: serde_json::from_value(history)?,
                    last_snapshot_at: row.get("last_snapshot_at"),
                },
            );
        }
        Ok(trajectories)
    }

    async fn snapshot_history(
        &self,
        student_id: Uuid,
    ) -> Result<Vec<SkillSnapshot>, EngineError> {
        let rows = sqlx::query(
            "SELECT id, student_id, enrollment_id, lesson_id, context, skills, created_at \
             FROM adaptive_progression.skill_snapshots \
             WHERE student_id = $1 AND context = 'POST_LESSON' \
             ORDER BY created_at ASC",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let skills: serde_json::Value = row.get("skills");
            snapshots.push(SkillSnapshot {
                id: row.get("id"),
                student_id: row.get("student_id"),
                enrollment_id: row.get("enrollment_id"),
                lesson_id: row.get("lesson_id"),
                context: SnapshotContext::PostLesson,
                skills: serde_json::from_value(skills)?,
                created_at: row.get("created_at"),
            });
        }
        Ok(snapshots)
    }
}

/// Insert a snapshot; a repeat attempt for the same (enrollment, lesson,
/// context) refreshes the existing row and keeps its id.
async fn upsert_snapshot(
    conn: &mut PgConnection,
    snapshot: &SkillSnapshot,
) -> Result<Uuid, EngineError> {
    let row = sqlx::query(
        r#"
        INSERT INTO adaptive_progression.skill_snapshots
        (id, student_id, enrollment_id, lesson_id, context, skills, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (enrollment_id, lesson_id, context) DO UPDATE
        SET skills = EXCLUDED.skills, created_at = EXCLUDED.created_at
        RETURNING id
        "#,
    )
    .bind(snapshot.id)
    .bind(snapshot.student_id)
    .bind(snapshot.enrollment_id)
    .bind(snapshot.lesson_id)
    .bind(snapshot.context.as_str())
    .bind(serde_json::to_value(&snapshot.skills)?)
    .bind(snapshot.created_at)
    .fetch_one(conn)
    .await?;
    Ok(row.get("id"))
}

pub async fn upsert_trajectory(
    conn: &mut PgConnection,
    trajectory: &SkillTrajectory,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO adaptive_progression.skill_trajectories
        (student_id, skill, trend, stability, history, last_snapshot_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, now())
        ON CONFLICT (student_id, skill) DO UPDATE
        SET trend = EXCLUDED.trend,
            stability = EXCLUDED.stability,
            history = EXCLUDED.history,
            last_snapshot_at = EXCLUDED.last_snapshot_at,
            updated_at = now()
        "#,
    )
    .bind(trajectory.student_id)
    .bind(trajectory.skill.as_str())
    .bind(trajectory.trend)
    .bind(trajectory.stability)
    .bind(serde_json::to_value(&trajectory.history)?)
    .bind(trajectory.last_snapshot_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_transition_record(
    conn: &mut PgConnection,
    record: &TransitionRecord,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO adaptive_progression.transition_records
        (id, enrollment_id, from_lesson_id, to_lesson_id, decision_code, confidence,
         rationale, snapshot_id, override_applied, override_id, override_reason, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(record.id)
    .bind(record.enrollment_id)
    .bind(record.from_lesson_id)
    .bind(record.to_lesson_id)
    .bind(record.decision_code.as_str())
    .bind(record.confidence)
    .bind(&record.rationale)
    .bind(record.snapshot_id)
    .bind(record.override_applied)
    .bind(record.override_id)
    .bind(&record.override_reason)
    .bind(record.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Persist one evaluation atomically: both snapshots, the delta, the
/// trajectories, the new skill profile, the mutated enrollment, and the
/// transition record. The enrollment's job guard is released in the same
/// write. Any failure rolls the whole transaction back.
pub async fn persist_outcome(
    tx: &mut Transaction<'_, Postgres>,
    outcome: &EvaluationOutcome,
) -> Result<(), EngineError> {
    let pre_id = upsert_snapshot(&mut *tx, &outcome.pre_snapshot).await?;
    let post_id = upsert_snapshot(&mut *tx, &outcome.post_snapshot).await?;

    sqlx::query(
        r#"
        INSERT INTO adaptive_progression.skill_deltas
        (id, pre_snapshot_id, post_snapshot_id, deltas, overall_delta)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(pre_id)
    .bind(post_id)
    .bind(serde_json::to_value(&outcome.delta.deltas)?)
    .bind(outcome.delta.overall_delta)
    .execute(&mut **tx)
    .await?;

    for trajectory in &outcome.trajectories {
        upsert_trajectory(&mut *tx, trajectory).await?;
    }

    for (skill, level) in &outcome.post_snapshot.skills {
        sqlx::query(
            r#"
            INSERT INTO adaptive_progression.skill_profiles (student_id, skill, level)
            VALUES ($1, $2, $3)
            ON CONFLICT (student_id, skill) DO UPDATE SET level = EXCLUDED.level
            "#,
        )
        .bind(outcome.post_snapshot.student_id)
        .bind(skill.as_str())
        .bind(level)
        .execute(&mut **tx)
        .await?;
    }

    sqlx::query(
        "UPDATE adaptive_progression.enrollments \
         SET current_lesson_id = $1, status = $2, completed_at = $3, active_job_id = NULL \
         WHERE id = $4",
    )
    .bind(outcome.enrollment.current_lesson_id)
    .bind(outcome.enrollment.status.as_str())
    .bind(outcome.enrollment.completed_at)
    .bind(outcome.enrollment.id)
    .execute(&mut **tx)
    .await?;

    // The decision is not real without its audit trail; this is last so an
    // earlier failure never leaves a record behind.
    let mut record = outcome.record.clone();
    record.snapshot_id = post_id;
    insert_transition_record(&mut *tx, &record).await?;

    Ok(())
}

pub async fn fetch_transition_records(
    pool: &PgPool,
    enrollment_id: Uuid,
) -> Result<Vec<TransitionRecord>, EngineError> {
    let rows = sqlx::query(
        "SELECT id, enrollment_id, from_lesson_id, to_lesson_id, decision_code, confidence, \
         rationale, snapshot_id, override_applied, override_id, override_reason, created_at \
         FROM adaptive_progression.transition_records \
         WHERE enrollment_id = $1 ORDER BY created_at ASC",
    )
    .bind(enrollment_id)
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let code: String = row.get("decision_code");
        records.push(TransitionRecord {
            id: row.get("id"),
            enrollment_id: row.get("enrollment_id"),
            from_lesson_id: row.get("from_lesson_id"),
            to_lesson_id: row.get("to_lesson_id"),
            decision_code: crate::models::DecisionCode::parse(&code)
                .unwrap_or(crate::models::DecisionCode::RepeatLesson),
            confidence: row.get("confidence"),
            rationale: row.get("rationale"),
            snapshot_id: row.get("snapshot_id"),
            override_applied: row.get("override_applied"),
            override_id: row.get("override_id"),
            override_reason: row.get("override_reason"),
            created_at: row.get("created_at"),
        });
    }
    Ok(records)
}

pub async fn students_with_snapshots(pool: &PgPool) -> Result<Vec<Uuid>, EngineError> {
    let rows = sqlx::query(
        "SELECT DISTINCT student_id FROM adaptive_progression.skill_snapshots \
         WHERE context = 'POST_LESSON'",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(|row| row.get("student_id")).collect())
}

/// Load realistic seed data: one course with three ordered lessons, two
/// students mid-course, skill profiles, and a scored task batch ready to
/// evaluate.
pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let course_id = Uuid::parse_str("7e4a2f10-5c3b-4a7d-9e81-2f6b0c9d1a43")?;
    sqlx::query(
        r#"
        INSERT INTO adaptive_progression.courses (id, title)
        VALUES ($1, $2)
        ON CONFLICT (id) DO UPDATE SET title = EXCLUDED.title
        "#,
    )
    .bind(course_id)
    .bind("English B1: Everyday Fluency")
    .execute(pool)
    .await?;

    let lessons = vec![
        (
            Uuid::parse_str("b1f3a6d2-8c44-4e1b-9f27-d05a3c7e8b91")?,
            "Past tenses in conversation",
            1,
            vec!["grammar", "vocabulary"],
        ),
        (
            Uuid::parse_str("c2a4b7e3-9d55-4f2c-8a38-e16b4d8f9ca2")?,
            "Describing daily routines",
            2,
            vec!["vocabulary", "speaking"],
        ),
        (
            Uuid::parse_str("d3b5c8f4-ae66-4a3d-9b49-f27c5e9a0db3")?,
            "Listening: short dialogues",
            3,
            vec!["listening", "vocabulary"],
        ),
    ];
    for (id, title, order, targets) in &lessons {
        sqlx::query(
            r#"
            INSERT INTO adaptive_progression.lessons
            (id, course_id, title, lesson_order, target_skills)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET title = EXCLUDED.title, target_skills = EXCLUDED.target_skills
            "#,
        )
        .bind(id)
        .bind(course_id)
        .bind(title)
        .bind(order)
        .bind(targets)
        .execute(pool)
        .await?;
    }

    let students = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "Mariya Ivanova",
            "mariya.ivanova@example.com",
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "Tomas Ruiz",
            "tomas.ruiz@example.com",
        ),
    ];
    for (id, name, email) in &students {
        sqlx::query(
            r#"
            INSERT INTO adaptive_progression.students (id, full_name, email)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO UPDATE SET full_name = EXCLUDED.full_name
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(email)
        .execute(pool)
        .await?;

        for (skill, level) in [("grammar", 0.62), ("vocabulary", 0.58), ("listening", 0.55)] {
            sqlx::query(
                r#"
                INSERT INTO adaptive_progression.skill_profiles (student_id, skill, level)
                VALUES ($1, $2, $3)
                ON CONFLICT (student_id, skill) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(skill)
            .bind(level)
            .execute(pool)
            .await?;
        }
    }

    let first_lesson = lessons[0].0;
    for (student_id, _, _) in &students {
        let enrollment_id: Uuid = sqlx::query(
            r#"
            INSERT INTO adaptive_progression.enrollments
            (id, student_id, course_id, current_lesson_id, status)
            VALUES ($1, $2, $3, $4, 'IN_PROGRESS')
            ON CONFLICT (student_id, course_id) DO UPDATE
            SET current_lesson_id = adaptive_progression.enrollments.current_lesson_id
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(course_id)
        .bind(first_lesson)
        .fetch_one(pool)
        .await?
        .get("id");

        let scores = serde_json::json!([
            { "skill": "grammar", "score": 0.82, "confidence": 0.9,
              "evidence": ["used past simple correctly in 7 of 8 prompts"] },
            { "skill": "vocabulary", "score": 0.78, "confidence": 0.85,
              "evidence": ["recalled 14 of 18 target words"] }
        ]);
        sqlx::query(
            r#"
            INSERT INTO adaptive_progression.task_assessments
            (id, enrollment_id, lesson_id, task_key, status, scores)
            VALUES ($1, $2, $3, $4, 'scored', $5)
            ON CONFLICT (enrollment_id, lesson_id, task_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(enrollment_id)
        .bind(first_lesson)
        .bind("seed-task-001")
        .bind(&scores)
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Import externally-assessed task results from a CSV file. One row per
/// (task, skill) observation; rows sharing a task key merge into one task
/// assessment. Re-importing the same task key replaces its scores.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        enrollment_id: Uuid,
        lesson_id: Uuid,
        task_key: String,
        status: String,
        skill: Option<String>,
        score: Option<f64>,
        confidence: Option<f64>,
        evidence: Option<String>,
        error_tags: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut grouped: BTreeMap<(Uuid, Uuid, String), TaskAssessment> = BTreeMap::new();

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let status = TaskStatus::parse(&row.status)
            .with_context(|| format!("unknown task status '{}'", row.status))?;
        let entry = grouped
            .entry((row.enrollment_id, row.lesson_id, row.task_key.clone()))
            .or_insert_with(|| TaskAssessment {
                task_key: row.task_key.clone(),
                status,
                scores: Vec::new(),
                error_tags: Vec::new(),
            });

        if let Some(skill) = row.skill.as_deref() {
            let skill = Skill::parse(skill)
                .with_context(|| format!("unknown skill '{skill}' in {}", csv_path.display()))?;
            entry.scores.push(crate::models::SkillScore {
                skill,
                score: row.score,
                confidence: row.confidence,
                evidence: row
                    .evidence
                    .map(|e| vec![e])
                    .unwrap_or_default(),
            });
        }
        if let Some(tags) = row.error_tags {
            for tag in tags.split(';').filter(|t| !t.is_empty()) {
                if !entry.error_tags.iter().any(|existing| existing == tag) {
                    entry.error_tags.push(tag.to_string());
                }
            }
        }
    }

    let mut inserted = 0usize;
    for ((enrollment_id, lesson_id, task_key), task) in grouped {
        let result = sqlx::query(
            r#"
            INSERT INTO adaptive_progression.task_assessments
            (id, enrollment_id, lesson_id, task_key, status, scores, error_tags)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (enrollment_id, lesson_id, task_key) DO UPDATE
            SET status = EXCLUDED.status,
                scores = EXCLUDED.scores,
                error_tags = EXCLUDED.error_tags
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(enrollment_id)
        .bind(lesson_id)
        .bind(&task_key)
        .bind(task.status.as_str())
        .bind(serde_json::to_value(&task.scores)?)
        .bind(&task.error_tags)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

/// Mark the enrollment errored and release its job guard after a failed or
/// aborted evaluation. Runs outside the rolled-back transaction.
pub async fn mark_assessment_error(
    pool: &PgPool,
    enrollment_id: Uuid,
) -> Result<(), EngineError> {
    sqlx::query(
        "UPDATE adaptive_progression.enrollments \
         SET status = 'ASSESSMENT_ERROR', active_job_id = NULL WHERE id = $1",
    )
    .bind(enrollment_id)
    .execute(pool)
    .await?;
    Ok(())
}
