//! Deterministic plan parsing.
//!
//! The planner worker returns free text that should contain exactly one
//! JSON plan object. Parsing is a fixed routine: strip code-fence
//! wrappers, locate the outermost balanced `{...}` region, decode it, and
//! validate the schema. Any failure is a typed error and fatal to the
//! task; there is no fallback.

use std::collections::HashSet;

use thiserror::Error;

use super::PlanSpec;

/// Errors that can occur during plan parsing and validation.
#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("no balanced JSON object found in planner output")]
    NoObject,

    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plan must contain at least one phase")]
    NoPhases,

    #[error("phase {index} is missing its {field}")]
    MissingPhaseField { index: usize, field: &'static str },

    #[error("duplicate phase id {0:?}")]
    DuplicatePhaseId(String),

    #[error("phase {phase:?} has no experts")]
    NoExperts { phase: String },

    #[error("expert {index} in phase {phase:?} is missing its {field}")]
    MissingExpertField {
        phase: String,
        index: usize,
        field: &'static str,
    },

    #[error("duplicate expert role {role:?} in phase {phase:?}")]
    DuplicateExpertRole { phase: String, role: String },
}

/// Parse and validate a planner response.
pub fn parse_plan(text: &str) -> Result<PlanSpec, PlanParseError> {
    let stripped = strip_code_fences(text);
    let object = extract_object(stripped).ok_or(PlanParseError::NoObject)?;
    let plan: PlanSpec = serde_json::from_str(object)?;
    validate(&plan)?;
    Ok(plan)
}

/// Remove a leading/trailing markdown code fence if the whole response is
/// wrapped in one (` ``` ` or ` ```json `).
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence's info string (e.g. "json") up to the first newline.
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Locate the outermost balanced `{ ... }` region.
///
/// Tracks JSON string and escape state so braces inside string literals do
/// not count. Returns `None` when no opening brace exists or the object
/// never closes.
fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Validate the decoded plan structure.
fn validate(plan: &PlanSpec) -> Result<(), PlanParseError> {
    if plan.phases.is_empty() {
        return Err(PlanParseError::NoPhases);
    }

    let mut phase_ids = HashSet::new();
    for (index, phase) in plan.phases.iter().enumerate() {
        for (value, field) in [
            (&phase.id, "id"),
            (&phase.name, "name"),
            (&phase.description, "description"),
        ] {
            if value.trim().is_empty() {
                return Err(PlanParseError::MissingPhaseField { index, field });
            }
        }
        if !phase_ids.insert(&phase.id) {
            return Err(PlanParseError::DuplicatePhaseId(phase.id.clone()));
        }

        if phase.experts.is_empty() {
            return Err(PlanParseError::NoExperts {
                phase: phase.id.clone(),
            });
        }

        let mut roles = HashSet::new();
        for (expert_index, expert) in phase.experts.iter().enumerate() {
            for (value, field) in [
                (&expert.role, "role"),
                (&expert.expertise, "expertise"),
                (&expert.persona, "persona"),
                (&expert.task, "task"),
            ] {
                if value.trim().is_empty() {
                    return Err(PlanParseError::MissingExpertField {
                        phase: phase.id.clone(),
                        index: expert_index,
                        field,
                    });
                }
            }
            if !roles.insert(&expert.role) {
                return Err(PlanParseError::DuplicateExpertRole {
                    phase: phase.id.clone(),
                    role: expert.role.clone(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_plan_json() -> String {
        r#"{
            "description": "Write a haiku",
            "phases": [{
                "id": "phase_1_drafting",
                "name": "Drafting",
                "description": "Draft the haiku",
                "experts": [{
                    "role": "poet",
                    "expertise": "Japanese poetry",
                    "persona": "You are a poet.",
                    "task": "Write a haiku about ponds."
                }]
            }]
        }"#
        .to_string()
    }

    #[test]
    fn parses_bare_json() {
        let plan = parse_plan(&minimal_plan_json()).expect("should parse");
        assert_eq!(plan.phases.len(), 1);
        assert_eq!(plan.phases[0].id, "phase_1_drafting");
        assert_eq!(plan.phases[0].experts[0].role, "poet");
    }

    #[test]
    fn parses_fenced_json() {
        let fenced = format!("```json\n{}\n```", minimal_plan_json());
        let plan = parse_plan(&fenced).expect("should parse fenced output");
        assert_eq!(plan.phases.len(), 1);
    }

    #[test]
    fn parses_json_embedded_in_prose() {
        let wrapped = format!(
            "Here is the plan you asked for:\n\n{}\n\nLet me know if it works.",
            minimal_plan_json()
        );
        let plan = parse_plan(&wrapped).expect("should parse embedded object");
        assert_eq!(plan.phases[0].experts.len(), 1);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_extraction() {
        let json = minimal_plan_json().replace(
            "Write a haiku about ponds.",
            "Write {nested} and \\\"quoted\\\" text } here.",
        );
        let plan = parse_plan(&json).expect("should parse despite braces in strings");
        assert!(plan.phases[0].experts[0].task.contains("{nested}"));
    }

    #[test]
    fn rejects_output_without_object() {
        let err = parse_plan("I could not produce a plan, sorry.").unwrap_err();
        assert!(matches!(err, PlanParseError::NoObject), "got: {err}");
    }

    #[test]
    fn rejects_unbalanced_object() {
        let err = parse_plan("{\"phases\": [").unwrap_err();
        assert!(matches!(err, PlanParseError::NoObject), "got: {err}");
    }

    #[test]
    fn rejects_invalid_json() {
        let err = parse_plan("{phases: nope}").unwrap_err();
        assert!(matches!(err, PlanParseError::Json(_)), "got: {err}");
    }

    #[test]
    fn rejects_zero_phases() {
        let err = parse_plan(r#"{"description": "Empty", "phases": []}"#).unwrap_err();
        assert!(matches!(err, PlanParseError::NoPhases), "got: {err}");
    }

    #[test]
    fn rejects_phase_missing_id() {
        let json = minimal_plan_json().replace("\"id\": \"phase_1_drafting\",", "");
        let err = parse_plan(&json).unwrap_err();
        assert!(
            matches!(
                err,
                PlanParseError::MissingPhaseField { index: 0, field: "id" }
            ),
            "got: {err}"
        );
    }

    #[test]
    fn rejects_phase_without_experts() {
        let json = r#"{
            "phases": [{
                "id": "phase_1",
                "name": "Empty",
                "description": "No one works here",
                "experts": []
            }]
        }"#;
        let err = parse_plan(json).unwrap_err();
        assert!(matches!(err, PlanParseError::NoExperts { .. }), "got: {err}");
    }

    #[test]
    fn rejects_expert_missing_persona() {
        let json = minimal_plan_json().replace("\"persona\": \"You are a poet.\",", "");
        let err = parse_plan(&json).unwrap_err();
        assert!(
            matches!(
                err,
                PlanParseError::MissingExpertField {
                    field: "persona",
                    ..
                }
            ),
            "got: {err}"
        );
    }

    #[test]
    fn rejects_duplicate_phase_ids() {
        let json = r#"{
            "phases": [
                {"id": "phase_1", "name": "A", "description": "a",
                 "experts": [{"role": "r1", "expertise": "e", "persona": "p", "task": "t"}]},
                {"id": "phase_1", "name": "B", "description": "b",
                 "experts": [{"role": "r2", "expertise": "e", "persona": "p", "task": "t"}]}
            ]
        }"#;
        let err = parse_plan(json).unwrap_err();
        assert!(
            matches!(err, PlanParseError::DuplicatePhaseId(ref id) if id == "phase_1"),
            "got: {err}"
        );
    }

    #[test]
    fn rejects_duplicate_expert_roles_within_a_phase() {
        let json = r#"{
            "phases": [
                {"id": "phase_1", "name": "A", "description": "a",
                 "experts": [
                    {"role": "poet", "expertise": "e", "persona": "p", "task": "t"},
                    {"role": "poet", "expertise": "e", "persona": "p", "task": "t"}
                 ]}
            ]
        }"#;
        let err = parse_plan(json).unwrap_err();
        assert!(
            matches!(err, PlanParseError::DuplicateExpertRole { ref role, .. } if role == "poet"),
            "got: {err}"
        );
    }

    #[test]
    fn strip_code_fences_handles_unfenced_text() {
        assert_eq!(strip_code_fences("  {\"a\": 1}  "), "{\"a\": 1}");
    }

    #[test]
    fn extract_object_takes_outermost_region() {
        let text = "noise {\"a\": {\"b\": 1}} trailing {\"c\": 2}";
        assert_eq!(extract_object(text), Some("{\"a\": {\"b\": 1}}"));
    }
}
