use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Decision, DecisionCode, Lesson, TeacherOverride, TransitionRecord};

const OVERRIDE_REASON_LIMIT: usize = 100;

/// Build the immutable audit record for one evaluation.
///
/// The to-lesson is re-derived from the decision code alone, independent of
/// what the state machine already applied, so a divergence between the two
/// is detectable from the audit trail.
pub fn build_record(
    enrollment_id: Uuid,
    from_lesson_id: Uuid,
    next_lesson: Option<&Lesson>,
    decision: &Decision,
    snapshot_id: Uuid,
    active_override: Option<&TeacherOverride>,
    now: DateTime<Utc>,
) -> TransitionRecord {
    let to_lesson_id = match decision.code {
        DecisionCode::AdvanceLesson => next_lesson.map(|l| l.id),
        DecisionCode::CompleteCourse => None,
        DecisionCode::RepeatLesson | DecisionCode::AdaptiveRepeatLesson => Some(from_lesson_id),
    };

    let override_applied = active_override.is_some()
        && decision
            .rationale
            .get("rule")
            .and_then(|v| v.as_str())
            .map(|rule| rule == "teacher_override")
            .unwrap_or(false);

    TransitionRecord {
        id: Uuid::new_v4(),
        enrollment_id,
        from_lesson_id,
        to_lesson_id,
        decision_code: decision.code,
        confidence: decision.confidence,
        rationale: decision.rationale.clone(),
        snapshot_id,
        override_applied,
        override_id: active_override.map(|o| o.id),
        override_reason: active_override.map(|o| truncate_reason(&o.reason)),
        created_at: now,
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.chars().count() <= OVERRIDE_REASON_LIMIT {
        return reason.to_string();
    }
    reason.chars().take(OVERRIDE_REASON_LIMIT).collect()
}
