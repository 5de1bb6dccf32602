//! Rule-based decomposition templates.
//!
//! Keyword families matched against the lowercased task description.
//! First match wins, checked in order of specificity: authentication,
//! CRUD, refactor, UI.

use super::SubtaskSpec;

fn spec(
    name: &str,
    description: &str,
    depends_on: &[usize],
    complexity: i32,
) -> SubtaskSpec {
    SubtaskSpec {
        name: name.to_owned(),
        description: description.to_owned(),
        depends_on: depends_on.to_vec(),
        recommended_tool: None,
        complexity,
    }
}

/// Try to match the description against a template family.
pub fn match_template(description: &str) -> Option<Vec<SubtaskSpec>> {
    let lowered = description.to_lowercase();
    let contains_any =
        |keywords: &[&str]| keywords.iter().any(|keyword| lowered.contains(keyword));

    if contains_any(&["auth", "login", "sign-in", "signin", "password", "oauth"]) {
        return Some(authentication_template());
    }
    if contains_any(&["crud", "rest api", "endpoint", "create, read", "resource api"]) {
        return Some(crud_template());
    }
    if contains_any(&["refactor", "restructure", "clean up", "cleanup", "extract"]) {
        return Some(refactor_template());
    }
    if contains_any(&["ui", "frontend", "page", "component", "screen", "dashboard"]) {
        return Some(ui_template());
    }
    None
}

/// Six subtasks in a linear-then-fan-out shape: schema -> model -> core
/// auth, then sessions, registration, and tests fan out from the core.
fn authentication_template() -> Vec<SubtaskSpec> {
    vec![
        spec(
            "design-auth-schema",
            "Design the user and credential storage schema: users table, password hashes, unique constraints on identity fields.",
            &[],
            2,
        ),
        spec(
            "implement-user-model",
            "Implement the user data model and persistence layer over the designed schema.",
            &[0],
            3,
        ),
        spec(
            "implement-credential-verification",
            "Implement password hashing and credential verification with a modern KDF and constant-time comparison.",
            &[1],
            4,
        ),
        spec(
            "implement-session-management",
            "Implement session issuance, validation, and expiry on top of credential verification.",
            &[2],
            3,
        ),
        spec(
            "implement-registration-flow",
            "Implement the registration flow: input validation, duplicate detection, initial credential setup.",
            &[2],
            3,
        ),
        spec(
            "write-auth-tests",
            "Write tests covering login success and failure, lockout behavior, and session expiry.",
            &[2],
            2,
        ),
    ]
}

fn crud_template() -> Vec<SubtaskSpec> {
    vec![
        spec(
            "design-resource-model",
            "Design the resource model and storage schema for the entity described in the task.",
            &[],
            2,
        ),
        spec(
            "implement-persistence",
            "Implement the persistence layer: create, fetch, list, update, delete operations.",
            &[0],
            3,
        ),
        spec(
            "implement-endpoints",
            "Implement the API endpoints over the persistence layer with input validation and error mapping.",
            &[1],
            3,
        ),
        spec(
            "write-endpoint-tests",
            "Write tests for each endpoint: happy paths, validation failures, missing-entity cases.",
            &[2],
            2,
        ),
    ]
}

fn refactor_template() -> Vec<SubtaskSpec> {
    vec![
        spec(
            "map-current-structure",
            "Map the current structure of the code named in the task and identify the seams to refactor along.",
            &[],
            2,
        ),
        spec(
            "apply-refactor",
            "Apply the refactor incrementally, keeping behavior identical at each step.",
            &[0],
            4,
        ),
        spec(
            "verify-behavior-preserved",
            "Run and extend the test suite to demonstrate the refactor preserved behavior.",
            &[1],
            2,
        ),
    ]
}

fn ui_template() -> Vec<SubtaskSpec> {
    vec![
        spec(
            "design-component-layout",
            "Design the component layout and state flow for the described interface.",
            &[],
            2,
        ),
        spec(
            "implement-components",
            "Implement the components with their props, state, and event handling.",
            &[0],
            3,
        ),
        spec(
            "wire-data-sources",
            "Wire the components to their data sources and handle loading and error states.",
            &[1],
            3,
        ),
        spec(
            "style-and-polish",
            "Apply styling, responsive behavior, and accessibility attributes.",
            &[1],
            2,
        ),
    ]
}
