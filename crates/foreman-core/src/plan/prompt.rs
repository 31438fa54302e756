//! Planning prompt construction.

/// Persona for the planner worker.
pub const PLANNER_PERSONA: &str = "You are a planning specialist. You break a user's objective into \
sequential phases, each staffed by a small team of specialist experts who \
work in parallel. You respond with a single JSON object and nothing else.";

/// Build the structured planning prompt for an objective.
///
/// The response contract mirrors [`super::PlanSpec`]: one JSON object with
/// a `phases` array; every phase needs an id, name, description, and a
/// non-empty `experts` array; every expert needs a role, expertise,
/// persona, and task. Experts in the first phase may not delegate, and the
/// scheduler enforces that regardless of what the plan says.
pub fn planning_prompt(objective: &str) -> String {
    format!(
        r#"Decompose the following objective into an execution plan.

OBJECTIVE:
{objective}

Respond with a single JSON object of this exact shape:

{{
  "description": "<one-line summary of the plan>",
  "phases": [
    {{
      "id": "phase_1_<short_slug>",
      "name": "<display name>",
      "description": "<what this phase accomplishes>",
      "experts": [
        {{
          "role": "<unique role within the phase>",
          "expertise": "<what this expert knows>",
          "persona": "<system prompt for the expert>",
          "task": "<concrete instructions for the expert>"
        }}
      ]
    }}
  ]
}}

Rules:
- Phases run strictly in order; experts within a phase run in parallel.
- Every phase must have at least one expert.
- Experts in the first phase may not delegate work to sub-tasks.
- Do not wrap the JSON in commentary."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_carries_the_objective() {
        let prompt = planning_prompt("Design an auth system.");
        assert!(prompt.contains("Design an auth system."));
        assert!(prompt.contains("\"phases\""));
    }

    #[test]
    fn prompt_states_the_first_phase_delegation_rule() {
        let prompt = planning_prompt("anything");
        assert!(prompt.contains("first phase may not delegate"));
    }
}
