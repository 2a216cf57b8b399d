use crate::api::{Actor, Role};
use crate::ipc::error::HandlerErr;

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn get_optional_bool(params: &serde_json::Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

pub fn get_required_bool(params: &serde_json::Value, key: &str) -> Result<bool, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Every request that acts on room data carries `params.actor`.
pub fn parse_actor(params: &serde_json::Value) -> Result<Actor, HandlerErr> {
    let actor = params
        .get("actor")
        .ok_or_else(|| HandlerErr::bad_params("missing actor"))?;
    let user_id = actor
        .get("userId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing actor.userId"))?;
    let role = match actor.get("role").and_then(|v| v.as_str()) {
        Some("teacher") => Role::Teacher,
        Some("student") => Role::Student,
        Some(other) => {
            return Err(HandlerErr::bad_params(format!("unknown role: {}", other)))
        }
        None => return Err(HandlerErr::bad_params("missing actor.role")),
    };
    let user_name = actor
        .get("userName")
        .and_then(|v| v.as_str())
        .unwrap_or(user_id)
        .to_string();
    Ok(Actor {
        user_id: user_id.to_string(),
        user_name,
        role,
    })
}

/// The single server-side authorization gate. All mutating handlers that
/// are teacher-only go through here, so the "students never write" rule
/// lives in one place instead of being re-checked ad hoc per call site.
pub fn require_teacher(params: &serde_json::Value) -> Result<Actor, HandlerErr> {
    let actor = parse_actor(params)?;
    if actor.role != Role::Teacher {
        return Err(HandlerErr::new("forbidden", "teacher role required"));
    }
    Ok(actor)
}

/// Entry submission is the one student-originated write; the author
/// edits the page directly instead.
pub fn require_student(params: &serde_json::Value) -> Result<Actor, HandlerErr> {
    let actor = parse_actor(params)?;
    if actor.role != Role::Student {
        return Err(HandlerErr::new("forbidden", "student role required"));
    }
    Ok(actor)
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
