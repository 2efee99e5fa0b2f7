use chrono::{DateTime, Utc};

use crate::decision::{focus_skills, DEFAULT_TARGET_SKILLS};
use crate::error::EngineError;
use crate::models::{Decision, DecisionCode, Enrollment, EnrollmentStatus, Lesson, Skill};

/// What applying a decision did to the enrollment, for the presentation
/// layer and the audit recorder.
#[derive(Debug, Clone)]
pub struct Transition {
    pub next_lesson_id: Option<uuid::Uuid>,
    pub completed: bool,
    pub restart_required: bool,
    /// Remediation focus carried by adaptive repeats.
    pub focus_skills: Vec<Skill>,
    /// Set when a stored decision code failed to parse.
    pub marker: Option<&'static str>,
}

/// Apply a decision to the enrollment. Repeats never move the lesson
/// pointer and never purge prior responses; an advance without a next
/// lesson is an invariant violation (the cascade should have completed the
/// course instead).
pub fn apply(
    enrollment: &mut Enrollment,
    decision: &Decision,
    next_lesson: Option<&Lesson>,
    now: DateTime<Utc>,
) -> Result<Transition, EngineError> {
    match decision.code {
        DecisionCode::AdvanceLesson => {
            let next = next_lesson.ok_or(EngineError::MissingNextLesson(enrollment.id))?;
            enrollment.current_lesson_id = next.id;
            enrollment.status = EnrollmentStatus::InProgress;
            Ok(Transition {
                next_lesson_id: Some(next.id),
                completed: false,
                restart_required: false,
                focus_skills: Vec::new(),
                marker: None,
            })
        }
        DecisionCode::CompleteCourse => {
            enrollment.status = EnrollmentStatus::Completed;
            enrollment.completed_at = Some(now);
            Ok(Transition {
                next_lesson_id: None,
                completed: true,
                restart_required: false,
                focus_skills: Vec::new(),
                marker: None,
            })
        }
        DecisionCode::RepeatLesson => Ok(Transition {
            next_lesson_id: None,
            completed: false,
            restart_required: true,
            focus_skills: Vec::new(),
            marker: None,
        }),
        DecisionCode::AdaptiveRepeatLesson => Ok(Transition {
            next_lesson_id: None,
            completed: false,
            restart_required: true,
            focus_skills: focus_skills(decision),
            marker: None,
        }),
    }
}

/// Apply a decision whose code arrives as a stored string. An unknown code
/// degrades to a repeat with a distinct marker rather than advancing.
pub fn apply_raw(
    enrollment: &mut Enrollment,
    code: &str,
    confidence: f64,
    rationale: serde_json::Value,
    next_lesson: Option<&Lesson>,
    now: DateTime<Utc>,
) -> Result<Transition, EngineError> {
    match DecisionCode::parse(code) {
        Some(parsed) => apply(
            enrollment,
            &Decision {
                code: parsed,
                confidence,
                rationale,
            },
            next_lesson,
            now,
        ),
        None => Ok(Transition {
            next_lesson_id: None,
            completed: false,
            restart_required: true,
            focus_skills: DEFAULT_TARGET_SKILLS.to_vec(),
            marker: Some("unknown_decision"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn enrollment(lesson_id: Uuid) -> Enrollment {
        Enrollment {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            current_lesson_id: lesson_id,
            status: EnrollmentStatus::InProgress,
            completed_at: None,
            active_job_id: None,
        }
    }

    fn lesson(course_id: Uuid, order: i32) -> Lesson {
        Lesson {
            id: Uuid::new_v4(),
            course_id,
            title: format!("Lesson {order}"),
            lesson_order: order,
            active: true,
            target_skills: Vec::new(),
            remedial: false,
        }
    }

    fn decision(code: DecisionCode) -> Decision {
        Decision {
            code,
            confidence: 0.85,
            rationale: json!({ "rule": "passing_criteria" }),
        }
    }

    #[test]
    fn advance_moves_the_lesson_pointer() {
        let current = Uuid::new_v4();
        let mut e = enrollment(current);
        let next = lesson(e.course_id, 2);

        let transition =
            apply(&mut e, &decision(DecisionCode::AdvanceLesson), Some(&next), Utc::now())
                .unwrap();
        assert_eq!(e.current_lesson_id, next.id);
        assert_eq!(transition.next_lesson_id, Some(next.id));
        assert!(!transition.completed);
    }

    #[test]
    fn advance_without_next_lesson_is_an_error() {
        let mut e = enrollment(Uuid::new_v4());
        let err =
            apply(&mut e, &decision(DecisionCode::AdvanceLesson), None, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::MissingNextLesson(_)));
    }

    #[test]
    fn complete_marks_enrollment_inactive_with_timestamp() {
        let mut e = enrollment(Uuid::new_v4());
        let now = Utc::now();
        let transition =
            apply(&mut e, &decision(DecisionCode::CompleteCourse), None, now).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert_eq!(e.completed_at, Some(now));
        assert!(transition.completed);
    }

    #[test]
    fn repeat_keeps_the_pointer_and_flags_restart() {
        let current = Uuid::new_v4();
        let mut e = enrollment(current);
        let transition =
            apply(&mut e, &decision(DecisionCode::RepeatLesson), None, Utc::now()).unwrap();
        assert_eq!(e.current_lesson_id, current);
        assert!(transition.restart_required);
    }

    #[test]
    fn adaptive_repeat_carries_weak_skills() {
        let mut e = enrollment(Uuid::new_v4());
        let d = Decision {
            code: DecisionCode::AdaptiveRepeatLesson,
            confidence: 0.75,
            rationale: json!({ "weak_skills": [{ "skill": "listening", "score": 0.4 }] }),
        };
        let transition = apply(&mut e, &d, None, Utc::now()).unwrap();
        assert_eq!(transition.focus_skills, vec![Skill::Listening]);
    }

    #[test]
    fn adaptive_repeat_with_no_weak_skills_uses_defaults() {
        let mut e = enrollment(Uuid::new_v4());
        let d = Decision {
            code: DecisionCode::AdaptiveRepeatLesson,
            confidence: 0.75,
            rationale: json!({}),
        };
        let transition = apply(&mut e, &d, None, Utc::now()).unwrap();
        assert_eq!(
            transition.focus_skills,
            vec![Skill::Grammar, Skill::Vocabulary]
        );
    }

    #[test]
    fn unknown_code_degrades_to_marked_repeat() {
        let current = Uuid::new_v4();
        let mut e = enrollment(current);
        let transition =
            apply_raw(&mut e, "TELEPORT", 0.5, json!({}), None, Utc::now()).unwrap();
        assert_eq!(e.current_lesson_id, current);
        assert!(transition.restart_required);
        assert_eq!(transition.marker, Some("unknown_decision"));
    }
}
