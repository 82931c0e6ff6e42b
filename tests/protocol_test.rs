use qwq_serve::protocol::{HealthResponse, HealthStatus};
use qwq_serve::{ChatRequest, Role};
use serde_json::json;

fn request(body: serde_json::Value) -> ChatRequest {
    serde_json::from_value(body).unwrap()
}

#[test]
fn test_system_prompt_absent_uses_default() {
    let req = request(json!({"messages": []}));
    assert_eq!(req.system_prompt, None);
    assert_eq!(req.resolved_system_prompt("default"), Some("default"));
}

#[test]
fn test_system_prompt_null_or_empty_disables_it() {
    let null = request(json!({"messages": [], "system_prompt": null}));
    assert_eq!(null.system_prompt, Some(None));
    assert_eq!(null.resolved_system_prompt("default"), None);

    let empty = request(json!({"messages": [], "system_prompt": ""}));
    assert_eq!(empty.resolved_system_prompt("default"), None);
}

#[test]
fn test_empty_server_default_disables_system_prompt() {
    let req = request(json!({"messages": []}));
    assert_eq!(req.resolved_system_prompt(""), None);
}

#[test]
fn test_roles_are_lowercase() {
    let req = request(json!({"messages": [
        {"role": "system", "content": "a"},
        {"role": "user", "content": "b"},
        {"role": "assistant", "content": "c"}
    ]}));
    let roles: Vec<Role> = req.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);

    let bad = serde_json::from_value::<ChatRequest>(json!({"messages": [{"role": "User", "content": "x"}]}));
    assert!(bad.is_err());
}

#[test]
fn test_validation() {
    assert!(request(json!({"messages": [], "temperature": 0})).validate().is_ok());
    assert!(request(json!({"messages": [], "max_tokens": 0})).validate().is_err());
    assert!(request(json!({"messages": [], "temperature": -1.0})).validate().is_err());
}

#[test]
fn test_health_omits_missing_error() {
    let ready = HealthResponse {
        status: HealthStatus::Ready,
        attempts: 1,
        last_error: None,
    };
    assert_eq!(
        serde_json::to_value(&ready).unwrap(),
        json!({"status": "ready", "attempts": 1})
    );
}
