use std::collections::{BTreeMap, BTreeSet};

use serde_json::json;
use tracing::info;

use crate::models::{Decision, DecisionCode, Skill, TeacherOverride};

/// Error tags that block the passing rule outright.
pub const CRITICAL_ERROR_TAGS: [&str; 2] = ["concept_gap", "system_failure"];

/// Target skills assumed when a lesson does not declare its own focus.
pub const DEFAULT_TARGET_SKILLS: [Skill; 2] = [Skill::Grammar, Skill::Vocabulary];

const PASS_SCORE: f64 = 0.7;
const PASS_DELTA: f64 = 0.1;
const CRITICAL_REGRESSION: f64 = -0.3;
const PROGRESS_DELTA: f64 = 0.05;
const WEAK_SKILL_SCORE: f64 = 0.6;

/// Everything the rule cascade looks at, gathered ahead of time so the
/// cascade itself stays free of storage concerns.
#[derive(Debug, Clone)]
pub struct DecisionInputs<'a> {
    pub aggregated: &'a BTreeMap<Skill, f64>,
    /// Post-lesson score minus the pre-lesson baseline, per skill.
    pub deltas: &'a BTreeMap<Skill, f64>,
    pub baseline: &'a BTreeMap<Skill, f64>,
    pub error_tags: &'a BTreeSet<String>,
    /// Lesson's declared focus; empty means the default applies.
    pub target_skills: &'a [Skill],
    pub active_override: Option<&'a TeacherOverride>,
    pub has_next_lesson: bool,
}

/// Evaluate the rule cascade. Strict priority order, first match wins:
/// teacher override, passing criteria, critical regression, partial
/// progress, fallback. Always yields exactly one decision.
pub fn decide(inputs: &DecisionInputs<'_>) -> Decision {
    let decision = run_cascade(inputs);
    info!(
        code = decision.code.as_str(),
        confidence = decision.confidence,
        "progression decision"
    );
    decision
}

fn run_cascade(inputs: &DecisionInputs<'_>) -> Decision {
    // Rule 1: a valid teacher override wins unconditionally.
    if let Some(overriding) = inputs.active_override {
        match DecisionCode::parse(&overriding.overridden_decision) {
            Some(code) => {
                return Decision {
                    code,
                    confidence: 1.0,
                    rationale: json!({
                        "rule": "teacher_override",
                        "override_id": overriding.id,
                        "original_decision": overriding.original_decision,
                        "overridden_decision": overriding.overridden_decision,
                    }),
                };
            }
            None => {
                // Malformed code: validation fallback, not a hard failure.
                return Decision {
                    code: DecisionCode::RepeatLesson,
                    confidence: 0.6,
                    rationale: json!({
                        "rule": "validation_fallback",
                        "override_id": overriding.id,
                        "rejected_code": overriding.overridden_decision,
                    }),
                };
            }
        }
    }

    let targets: Vec<Skill> = if inputs.target_skills.is_empty() {
        DEFAULT_TARGET_SKILLS.to_vec()
    } else {
        inputs.target_skills.to_vec()
    };

    // Rule 2: passing criteria across every target skill.
    let critical_tag = inputs
        .error_tags
        .iter()
        .find(|tag| CRITICAL_ERROR_TAGS.contains(&tag.as_str()));
    let all_passing = targets.iter().all(|skill| {
        let score = inputs.aggregated.get(skill).copied().unwrap_or(0.0);
        let delta = inputs.deltas.get(skill).copied().unwrap_or(0.0);
        score >= PASS_SCORE && delta >= PASS_DELTA
    });
    if all_passing && critical_tag.is_none() {
        let target_detail: Vec<_> = targets
            .iter()
            .map(|skill| {
                json!({
                    "skill": skill.as_str(),
                    "score": inputs.aggregated.get(skill).copied().unwrap_or(0.0),
                    "delta": inputs.deltas.get(skill).copied().unwrap_or(0.0),
                })
            })
            .collect();
        if inputs.has_next_lesson {
            return Decision {
                code: DecisionCode::AdvanceLesson,
                confidence: 0.85,
                rationale: json!({ "rule": "passing_criteria", "targets": target_detail }),
            };
        }
        return Decision {
            code: DecisionCode::CompleteCourse,
            confidence: 0.9,
            rationale: json!({
                "rule": "passing_criteria",
                "last_lesson": true,
                "targets": target_detail,
            }),
        };
    }

    // Rule 3: any skill regressing hard forces a repeat.
    let regressed: Vec<_> = inputs
        .deltas
        .iter()
        .filter(|(_, delta)| **delta < CRITICAL_REGRESSION)
        .map(|(skill, delta)| {
            let after = inputs.aggregated.get(skill).copied().unwrap_or(0.0);
            let before = inputs.baseline.get(skill).copied().unwrap_or(after - delta);
            json!({
                "skill": skill.as_str(),
                "before": before,
                "after": after,
                "delta": delta,
            })
        })
        .collect();
    if !regressed.is_empty() {
        return Decision {
            code: DecisionCode::RepeatLesson,
            confidence: 0.9,
            rationale: json!({ "rule": "critical_regression", "regressed_skills": regressed }),
        };
    }

    // Rule 4: some but not all targets moved forward.
    let improved_targets = targets
        .iter()
        .filter(|skill| inputs.deltas.get(*skill).copied().unwrap_or(0.0) > PROGRESS_DELTA)
        .count();
    if improved_targets > 0 && improved_targets < targets.len() {
        let mut weak: Vec<(Skill, f64)> = inputs
            .aggregated
            .iter()
            .filter(|(_, score)| **score < WEAK_SKILL_SCORE)
            .map(|(skill, score)| (*skill, *score))
            .collect();
        weak.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mean_delta = if inputs.deltas.is_empty() {
            0.0
        } else {
            inputs.deltas.values().sum::<f64>() / inputs.deltas.len() as f64
        };
        let improved = inputs
            .deltas
            .values()
            .filter(|d| **d > PROGRESS_DELTA)
            .count();
        let regressed_count = inputs
            .deltas
            .values()
            .filter(|d| **d < -PROGRESS_DELTA)
            .count();
        let stable = inputs.deltas.len() - improved - regressed_count;

        return Decision {
            code: DecisionCode::AdaptiveRepeatLesson,
            confidence: 0.75,
            rationale: json!({
                "rule": "partial_progress",
                "weak_skills": weak
                    .iter()
                    .map(|(skill, score)| json!({ "skill": skill.as_str(), "score": score }))
                    .collect::<Vec<_>>(),
                "progress": {
                    "mean_delta": mean_delta,
                    "improved": improved,
                    "regressed": regressed_count,
                    "stable": stable,
                },
            }),
        };
    }

    // Rule 5: nothing else matched.
    Decision {
        code: DecisionCode::RepeatLesson,
        confidence: 0.6,
        rationale: json!({ "rule": "default_fallback" }),
    }
}

/// Skills the adaptive repeat should focus on, read back out of the
/// rationale. Falls back to the default target pair when the decision
/// carried no weak skills.
pub fn focus_skills(decision: &Decision) -> Vec<Skill> {
    let from_rationale: Vec<Skill> = decision
        .rationale
        .get("weak_skills")
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("skill"))
                .filter_map(|v| v.as_str())
                .filter_map(Skill::parse)
                .collect()
        })
        .unwrap_or_default();

    if from_rationale.is_empty() {
        DEFAULT_TARGET_SKILLS.to_vec()
    } else {
        from_rationale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    struct Scenario {
        aggregated: BTreeMap<Skill, f64>,
        deltas: BTreeMap<Skill, f64>,
        baseline: BTreeMap<Skill, f64>,
        error_tags: BTreeSet<String>,
        target_skills: Vec<Skill>,
        active_override: Option<TeacherOverride>,
        has_next_lesson: bool,
    }

    impl Scenario {
        fn new(skills: Vec<(Skill, f64, f64)>) -> Self {
            let mut aggregated = BTreeMap::new();
            let mut deltas = BTreeMap::new();
            let mut baseline = BTreeMap::new();
            for (skill, score, delta) in skills {
                aggregated.insert(skill, score);
                deltas.insert(skill, delta);
                baseline.insert(skill, score - delta);
            }
            Scenario {
                aggregated,
                deltas,
                baseline,
                error_tags: BTreeSet::new(),
                target_skills: Vec::new(),
                active_override: None,
                has_next_lesson: true,
            }
        }

        fn decide(&self) -> Decision {
            decide(&DecisionInputs {
                aggregated: &self.aggregated,
                deltas: &self.deltas,
                baseline: &self.baseline,
                error_tags: &self.error_tags,
                target_skills: &self.target_skills,
                active_override: self.active_override.as_ref(),
                has_next_lesson: self.has_next_lesson,
            })
        }
    }

    fn override_with(code: &str) -> TeacherOverride {
        TeacherOverride {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            lesson_id: Uuid::new_v4(),
            original_decision: "REPEAT_LESSON".to_string(),
            overridden_decision: code.to_string(),
            reason: "teacher saw strong in-class performance".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn passing_targets_advance_when_next_lesson_exists() {
        let scenario = Scenario::new(vec![
            (Skill::Grammar, 0.75, 0.12),
            (Skill::Vocabulary, 0.72, 0.11),
        ]);
        let decision = scenario.decide();
        assert_eq!(decision.code, DecisionCode::AdvanceLesson);
        assert_eq!(decision.confidence, 0.85);
    }

    #[test]
    fn passing_targets_complete_course_on_last_lesson() {
        let mut scenario = Scenario::new(vec![
            (Skill::Grammar, 0.75, 0.12),
            (Skill::Vocabulary, 0.72, 0.11),
        ]);
        scenario.has_next_lesson = false;
        let decision = scenario.decide();
        assert_eq!(decision.code, DecisionCode::CompleteCourse);
        assert_eq!(decision.confidence, 0.9);
    }

    #[test]
    fn valid_override_beats_every_computed_signal() {
        let mut scenario = Scenario::new(vec![
            (Skill::Grammar, 0.75, 0.12),
            (Skill::Vocabulary, 0.72, 0.11),
        ]);
        scenario.active_override = Some(override_with("COMPLETE_COURSE"));
        let decision = scenario.decide();
        assert_eq!(decision.code, DecisionCode::CompleteCourse);
        assert_eq!(decision.confidence, 1.0);
        assert_eq!(decision.rationale["rule"], "teacher_override");
    }

    #[test]
    fn invalid_override_falls_back_to_repeat() {
        let mut scenario = Scenario::new(vec![
            (Skill::Grammar, 0.75, 0.12),
            (Skill::Vocabulary, 0.72, 0.11),
        ]);
        scenario.active_override = Some(override_with("SKIP_TO_END"));
        let decision = scenario.decide();
        assert_eq!(decision.code, DecisionCode::RepeatLesson);
        assert_eq!(decision.confidence, 0.6);
        assert_eq!(decision.rationale["rule"], "validation_fallback");
        assert_eq!(decision.rationale["rejected_code"], "SKIP_TO_END");
    }

    #[test]
    fn critical_error_tag_blocks_advancement() {
        let mut scenario = Scenario::new(vec![
            (Skill::Grammar, 0.8, 0.15),
            (Skill::Vocabulary, 0.8, 0.15),
        ]);
        scenario.error_tags.insert("concept_gap".to_string());
        let decision = scenario.decide();
        assert_ne!(decision.code, DecisionCode::AdvanceLesson);
    }

    #[test]
    fn critical_regression_forces_repeat_and_names_the_skill() {
        let scenario = Scenario::new(vec![
            (Skill::Grammar, 0.6, 0.0),
            (Skill::Vocabulary, 0.6, 0.0),
            (Skill::Listening, 0.3, -0.35),
        ]);
        let decision = scenario.decide();
        assert_eq!(decision.code, DecisionCode::RepeatLesson);
        assert_eq!(decision.confidence, 0.9);
        let listed = serde_json::to_string(&decision.rationale).unwrap();
        assert!(listed.contains("listening"));
    }

    #[test]
    fn partial_progress_triggers_adaptive_repeat() {
        let scenario = Scenario::new(vec![
            (Skill::Grammar, 0.75, 0.12),
            (Skill::Vocabulary, 0.45, 0.01),
        ]);
        let decision = scenario.decide();
        assert_eq!(decision.code, DecisionCode::AdaptiveRepeatLesson);
        assert_eq!(decision.confidence, 0.75);
        let weak = decision.rationale["weak_skills"].as_array().unwrap();
        assert_eq!(weak[0]["skill"], "vocabulary");
    }

    #[test]
    fn weak_skills_are_sorted_ascending_by_score() {
        let mut scenario = Scenario::new(vec![
            (Skill::Grammar, 0.75, 0.12),
            (Skill::Vocabulary, 0.5, 0.01),
            (Skill::Reading, 0.3, 0.0),
        ]);
        scenario.target_skills = vec![Skill::Grammar, Skill::Vocabulary];
        let decision = scenario.decide();
        let weak = decision.rationale["weak_skills"].as_array().unwrap();
        assert_eq!(weak[0]["skill"], "reading");
        assert_eq!(weak[1]["skill"], "vocabulary");
    }

    #[test]
    fn no_progress_at_all_hits_the_fallback() {
        let scenario = Scenario::new(vec![
            (Skill::Grammar, 0.5, 0.0),
            (Skill::Vocabulary, 0.5, 0.0),
        ]);
        let decision = scenario.decide();
        assert_eq!(decision.code, DecisionCode::RepeatLesson);
        assert_eq!(decision.confidence, 0.6);
        assert_eq!(decision.rationale["rule"], "default_fallback");
    }

    #[test]
    fn lesson_target_skills_replace_the_default_pair() {
        let mut scenario = Scenario::new(vec![
            (Skill::Listening, 0.8, 0.2),
            (Skill::Grammar, 0.2, 0.0),
        ]);
        scenario.target_skills = vec![Skill::Listening];
        let decision = scenario.decide();
        assert_eq!(decision.code, DecisionCode::AdvanceLesson);
    }

    #[test]
    fn focus_skills_fall_back_to_defaults() {
        let decision = Decision {
            code: DecisionCode::AdaptiveRepeatLesson,
            confidence: 0.75,
            rationale: serde_json::json!({ "weak_skills": [] }),
        };
        assert_eq!(focus_skills(&decision), DEFAULT_TARGET_SKILLS.to_vec());
    }

    #[test]
    fn focus_skills_read_the_rationale() {
        let decision = Decision {
            code: DecisionCode::AdaptiveRepeatLesson,
            confidence: 0.75,
            rationale: serde_json::json!({
                "weak_skills": [{ "skill": "listening", "score": 0.4 }]
            }),
        };
        assert_eq!(focus_skills(&decision), vec![Skill::Listening]);
    }
}
