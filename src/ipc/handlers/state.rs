use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_optional_i64, get_required_str, now_ms, require_teacher};
use crate::ipc::types::{AppState, Request};

fn load_row(conn: &Connection, room_id: &str) -> Result<Option<(String, i64)>, HandlerErr> {
    conn.query_row(
        "SELECT state, updated_at FROM room_state WHERE room_id = ?",
        [room_id],
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
    )
    .optional()
    .map_err(HandlerErr::db)
}

fn state_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let room_id = get_required_str(params, "roomId")?;
    let since = get_optional_i64(params, "since");
    let row = load_row(conn, &room_id)?;

    let (state_text, updated_at) = match row {
        Some(v) => v,
        None => ("{}".to_string(), 0),
    };

    if let Some(since) = since {
        if updated_at <= since {
            return Ok(json!({ "changed": false }));
        }
    }

    let state: serde_json::Value = serde_json::from_str(&state_text)
        .map_err(|e| HandlerErr::new("corrupt_state", e.to_string()))?;
    Ok(json!({
        "changed": true,
        "state": state,
        "updatedAt": updated_at,
    }))
}

fn state_put(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_teacher(params)?;
    let room_id = get_required_str(params, "roomId")?;
    let state = params
        .get("state")
        .ok_or_else(|| HandlerErr::bad_params("missing state"))?;
    if !state.is_object() {
        return Err(HandlerErr::bad_params("state must be an object"));
    }

    // Strictly monotonic per room so changed-since cursors never miss a
    // write that lands within the same millisecond.
    let prev = load_row(conn, &room_id)?.map(|(_, t)| t).unwrap_or(0);
    let updated_at = now_ms().max(prev + 1);

    let state_text = state.to_string();
    conn.execute(
        "INSERT INTO room_state(room_id, state, updated_at, updated_by)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(room_id) DO UPDATE SET
           state = excluded.state,
           updated_at = excluded.updated_at,
           updated_by = excluded.updated_by",
        (&room_id, &state_text, updated_at, &actor.user_id),
    )
    .map_err(|e| HandlerErr::new("db_write_failed", e.to_string()))?;

    Ok(json!({ "updatedAt": updated_at }))
}

fn handle_state_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match state_get(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_state_put(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match state_put(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "state.get" => Some(handle_state_get(state, req)),
        "state.put" => Some(handle_state_put(state, req)),
        _ => None,
    }
}
