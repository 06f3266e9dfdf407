//! Static persona and scenario catalogue, and resolution of configured scenarios.

use crate::config::ScenarioDefinition;
use crate::error::{EvalError, Result};
use crate::models::{Difficulty, ExpectedBehavior, Persona, Scenario, TestPrompt};
use tracing::warn;

fn persona(name: &str, traits: &[&str], accessibility_needs: &[&str]) -> Persona {
    Persona {
        name: name.to_string(),
        traits: traits.iter().map(|t| t.to_string()).collect(),
        accessibility_needs: accessibility_needs.iter().map(|n| n.to_string()).collect(),
    }
}

fn behavior(description: &str, keywords: &[&str]) -> ExpectedBehavior {
    ExpectedBehavior {
        description: description.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    }
}

pub fn builtin_personas() -> Vec<Persona> {
    vec![
        persona("Alex", &["busy professional", "terse", "back-to-back meetings"], &[]),
        persona(
            "Morgan",
            &["methodical", "prefers step-by-step confirmation"],
            &["screen reader", "avoid visual-only cues"],
        ),
        persona("Sam", &["student", "irregular schedule", "procrastinates"], &[]),
        persona("Jordan", &["fitness focused", "early riser"], &["large text"]),
    ]
}

fn definition(
    name: &str,
    persona: &str,
    category: &str,
    difficulty: Difficulty,
    prompts: &[&str],
    expected_behaviors: Vec<ExpectedBehavior>,
) -> ScenarioDefinition {
    ScenarioDefinition {
        name: Some(name.to_string()),
        persona: Some(persona.to_string()),
        category: category.to_string(),
        difficulty,
        prompts: prompts.iter().map(|p| p.to_string()).collect(),
        expected_behaviors,
    }
}

pub fn builtin_definitions() -> Vec<ScenarioDefinition> {
    vec![
        definition(
            "Morning Routine Setup",
            "Jordan",
            "recurring_events",
            Difficulty::Easy,
            &[
                "Set up a 6am workout every weekday",
                "Add a 15 minute stretch after each workout",
            ],
            vec![
                behavior("confirms the recurring event", &["every weekday", "recurring", "repeats"]),
                behavior("states the time", &["6am", "6:00"]),
            ],
        ),
        definition(
            "Travel Planning",
            "Alex",
            "timezones",
            Difficulty::Hard,
            &[
                "I fly to Tokyo on Monday, move my 9am standup to Tokyo time",
                "Block the whole flight as busy",
            ],
            vec![
                behavior("handles the timezone change", &["JST", "Tokyo time", "timezone"]),
                behavior("confirms the change", &["moved", "updated", "rescheduled"]),
            ],
        ),
        definition(
            "Family Coordination",
            "Morgan",
            "shared_calendars",
            Difficulty::Medium,
            &[
                "Find a free evening this week for a family dinner",
                "Remind everyone the day before",
            ],
            vec![
                behavior("proposes a concrete slot", &["evening", "pm"]),
                behavior("reads back the details in text", &["reminder", "day before"]),
            ],
        ),
        definition(
            "Study Schedule Optimization",
            "Sam",
            "planning",
            Difficulty::Medium,
            &[
                "I have exams on Friday, plan two hours of study each day until then",
                "Move tomorrow's session if it clashes with my lab",
            ],
            vec![
                behavior("creates study blocks", &["study", "session"]),
                behavior("detects conflicts", &["conflict", "clash", "overlap"]),
            ],
        ),
    ]
}

/// Turn one definition into a scenario, checking its required fields
pub fn resolve_definition(definition: &ScenarioDefinition, personas: &[Persona]) -> Result<Scenario> {
    let name = match definition.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => return Err(EvalError::InvalidScenario("scenario is missing a name".to_string())),
    };

    let persona_name = definition
        .persona
        .as_deref()
        .ok_or_else(|| EvalError::InvalidScenario(format!("scenario '{}' is missing a persona", name)))?;

    let persona = personas
        .iter()
        .find(|p| p.name == persona_name)
        .cloned()
        .ok_or_else(|| {
            EvalError::InvalidScenario(format!(
                "scenario '{}' references unknown persona '{}'",
                name, persona_name
            ))
        })?;

    Ok(Scenario {
        name,
        persona,
        category: definition.category.clone(),
        difficulty: definition.difficulty,
        test_prompts: definition
            .prompts
            .iter()
            .map(|prompt| TestPrompt { prompt: prompt.clone(), intent: None })
            .collect(),
        expected_behaviors: definition.expected_behaviors.clone(),
    })
}

/// Resolve every definition, skipping invalid ones. Returns the scenarios
/// and one warning per skipped definition.
pub fn resolve_all(definitions: &[ScenarioDefinition], personas: &[Persona]) -> (Vec<Scenario>, Vec<String>) {
    let mut scenarios = Vec::new();
    let mut warnings = Vec::new();

    for (index, definition) in definitions.iter().enumerate() {
        match resolve_definition(definition, personas) {
            Ok(scenario) => scenarios.push(scenario),
            Err(e) => {
                warn!(index, error = %e, "Skipping scenario definition");
                warnings.push(format!("Skipped scenario #{}: {}", index + 1, e));
            }
        }
    }

    (scenarios, warnings)
}

/// Scenarios from config when present, else the built-in catalogue.
/// Configured personas extend the built-in ones.
pub fn load_scenarios(definitions: &[ScenarioDefinition], extra_personas: &[Persona]) -> (Vec<Scenario>, Vec<String>) {
    let mut personas = builtin_personas();
    for extra in extra_personas {
        personas.retain(|p| p.name != extra.name);
        personas.push(extra.clone());
    }

    if definitions.is_empty() {
        resolve_all(&builtin_definitions(), &personas)
    } else {
        resolve_all(definitions, &personas)
    }
}

/// Keep only the named scenarios, in the order given. Names matching nothing
/// produce a warning. An empty selection keeps everything.
pub fn select_scenarios(scenarios: Vec<Scenario>, names: &[String]) -> (Vec<Scenario>, Vec<String>) {
    if names.is_empty() {
        return (scenarios, Vec::new());
    }

    let mut selected = Vec::new();
    let mut warnings = Vec::new();
    for name in names {
        match scenarios.iter().find(|s| s.name.eq_ignore_ascii_case(name)) {
            Some(scenario) => selected.push(scenario.clone()),
            None => {
                warn!(scenario = %name, "No scenario with this name");
                warnings.push(format!("Unknown scenario '{}'", name));
            }
        }
    }
    (selected, warnings)
}
