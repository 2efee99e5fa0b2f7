use std::fmt::Write;

use crate::models::{SkillTrajectory, TransitionRecord};

/// Render the explainability feed for one enrollment as markdown: every
/// decision with its rationale and override provenance, then the current
/// trajectory per skill.
pub fn build_report(
    enrollment_label: &str,
    records: &[TransitionRecord],
    trajectories: &[SkillTrajectory],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Progression Audit Report");
    let _ = writeln!(output, "Enrollment {enrollment_label}");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Decisions");

    if records.is_empty() {
        let _ = writeln!(output, "No evaluations recorded for this enrollment.");
    } else {
        for record in records {
            let rule = record
                .rationale
                .get("rule")
                .and_then(|v| v.as_str())
                .unwrap_or("unspecified");
            let to_lesson = record
                .to_lesson_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "course complete".to_string());
            let _ = writeln!(
                output,
                "- {}: {} (confidence {:.2}, rule {}) lesson {} -> {}",
                record.created_at.format("%Y-%m-%d %H:%M"),
                record.decision_code.as_str(),
                record.confidence,
                rule,
                record.from_lesson_id,
                to_lesson
            );
            if record.override_applied {
                let reason = record.override_reason.as_deref().unwrap_or("no reason given");
                let _ = writeln!(output, "  - teacher override in force: {reason}");
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Skill Trajectories");

    if trajectories.is_empty() {
        let _ = writeln!(output, "No trajectory data yet.");
    } else {
        let mut sorted: Vec<&SkillTrajectory> = trajectories.iter().collect();
        sorted.sort_by_key(|t| t.skill);
        for trajectory in sorted {
            let direction = if trajectory.trend > 0.02 {
                "improving"
            } else if trajectory.trend < -0.02 {
                "declining"
            } else {
                "flat"
            };
            let _ = writeln!(
                output,
                "- {}: trend {:+.3} ({}), stability {:.2}, {} snapshots",
                trajectory.skill.as_str(),
                trajectory.trend,
                direction,
                trajectory.stability,
                trajectory.history.len()
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DecisionCode, Skill, TrajectoryPoint};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn record(code: DecisionCode, rule: &str) -> TransitionRecord {
        TransitionRecord {
            id: Uuid::new_v4(),
            enrollment_id: Uuid::new_v4(),
            from_lesson_id: Uuid::new_v4(),
            to_lesson_id: Some(Uuid::new_v4()),
            decision_code: code,
            confidence: 0.85,
            rationale: json!({ "rule": rule }),
            snapshot_id: Uuid::new_v4(),
            override_applied: false,
            override_id: None,
            override_reason: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn report_lists_decisions_and_trajectories() {
        let records = vec![record(DecisionCode::AdvanceLesson, "passing_criteria")];
        let trajectories = vec![SkillTrajectory {
            student_id: Uuid::new_v4(),
            skill: Skill::Grammar,
            trend: 0.12,
            stability: 0.74,
            history: vec![TrajectoryPoint {
                at: Utc::now(),
                value: 0.7,
            }],
            last_snapshot_at: Some(Utc::now()),
        }];

        let report = build_report("demo", &records, &trajectories);
        assert!(report.contains("ADVANCE_LESSON"));
        assert!(report.contains("passing_criteria"));
        assert!(report.contains("grammar: trend +0.120 (improving)"));
    }

    #[test]
    fn override_provenance_shows_up() {
        let mut r = record(DecisionCode::CompleteCourse, "teacher_override");
        r.override_applied = true;
        r.override_reason = Some("final oral exam passed".to_string());

        let report = build_report("demo", &[r], &[]);
        assert!(report.contains("teacher override in force: final oral exam passed"));
    }

    #[test]
    fn empty_report_is_well_formed() {
        let report = build_report("demo", &[], &[]);
        assert!(report.contains("No evaluations recorded"));
        assert!(report.contains("No trajectory data yet."));
    }
}
