use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::api::Role;
use crate::blocks;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_required_bool, get_required_i64, get_required_str, now_ms, parse_actor, require_student,
    require_teacher,
};
use crate::ipc::types::{AppState, Request};

fn page_exists(conn: &Connection, page_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM notebook_pages WHERE id = ?", [page_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

fn parse_content_text(text: &str) -> Result<serde_json::Value, HandlerErr> {
    serde_json::from_str(text).map_err(|e| HandlerErr::new("corrupt_content", e.to_string()))
}

fn pages_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let room_id = get_required_str(params, "roomId")?;
    let mut stmt = conn
        .prepare(
            "SELECT
               p.id,
               p.title,
               p.content,
               p.created_by,
               p.updated_at,
               (SELECT COUNT(*) FROM notebook_entries e
                WHERE e.page_id = p.id AND e.status = 'pending') AS pending_entries
             FROM notebook_pages p
             WHERE p.room_id = ?
             ORDER BY p.sort_order",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&room_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let content_text: String = row.get(2)?;
            let created_by: String = row.get(3)?;
            let updated_at: i64 = row.get(4)?;
            let pending_entries: i64 = row.get(5)?;
            Ok((id, title, content_text, created_by, updated_at, pending_entries))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut pages = Vec::with_capacity(rows.len());
    for (id, title, content_text, created_by, updated_at, pending_entries) in rows {
        pages.push(json!({
            "pageId": id,
            "title": title,
            "content": parse_content_text(&content_text)?,
            "createdBy": created_by,
            "updatedAt": updated_at,
            "pendingEntries": pending_entries,
        }));
    }
    Ok(json!({ "pages": pages }))
}

fn page_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_teacher(params)?;
    let room_id = get_required_str(params, "roomId")?;
    let title = get_required_str(params, "title")?.trim().to_string();
    if title.is_empty() {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM notebook_pages WHERE room_id = ?",
            [&room_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;

    let page_id = Uuid::new_v4().to_string();
    let updated_at = now_ms();
    let content = json!({ "blocks": [] });
    conn.execute(
        "INSERT INTO notebook_pages(id, room_id, title, content, created_by, updated_at, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &page_id,
            &room_id,
            &title,
            content.to_string(),
            &actor.user_id,
            updated_at,
            next_sort,
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "page": {
            "pageId": page_id,
            "title": title,
            "content": content,
            "createdBy": actor.user_id,
            "updatedAt": updated_at,
            "pendingEntries": 0,
        }
    }))
}

fn page_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_teacher(params)?;
    let page_id = get_required_str(params, "pageId")?;
    if !page_exists(conn, &page_id)? {
        return Err(HandlerErr::not_found("page not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    tx.execute("DELETE FROM notebook_entries WHERE page_id = ?", [&page_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.execute("DELETE FROM notebook_pages WHERE id = ?", [&page_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

fn page_update_title(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_teacher(params)?;
    let page_id = get_required_str(params, "pageId")?;
    let title = get_required_str(params, "title")?.trim().to_string();
    if title.is_empty() {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }
    let updated = conn
        .execute(
            "UPDATE notebook_pages SET title = ?, updated_at = ? WHERE id = ?",
            (&title, now_ms(), &page_id),
        )
        .map_err(|e| HandlerErr::new("db_write_failed", e.to_string()))?;
    if updated == 0 {
        return Err(HandlerErr::not_found("page not found"));
    }
    Ok(json!({ "ok": true }))
}

fn page_update_content(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_teacher(params)?;
    let page_id = get_required_str(params, "pageId")?;
    let content = params
        .get("content")
        .ok_or_else(|| HandlerErr::bad_params("missing content"))?;
    // Reject documents the block model cannot address; a malformed page
    // would break cell write-back later.
    if let Err(e) = blocks::parse_content(content) {
        return Err(HandlerErr::bad_params(format!("invalid content: {}", e)));
    }
    let updated = conn
        .execute(
            "UPDATE notebook_pages SET content = ?, updated_at = ? WHERE id = ?",
            (content.to_string(), now_ms(), &page_id),
        )
        .map_err(|e| HandlerErr::new("db_write_failed", e.to_string()))?;
    if updated == 0 {
        return Err(HandlerErr::not_found("page not found"));
    }
    Ok(json!({ "ok": true }))
}

fn entry_row_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let page_id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let user_id: String = row.get(3)?;
    let user_name: String = row.get(4)?;
    let content: String = row.get(5)?;
    let block_id: Option<String> = row.get(6)?;
    let cell_row: Option<i64> = row.get(7)?;
    let cell_col: Option<i64> = row.get(8)?;
    let status: String = row.get(9)?;
    Ok(json!({
        "entryId": id,
        "pageId": page_id,
        "kind": kind,
        "userId": user_id,
        "userName": user_name,
        "content": content,
        "blockId": block_id,
        "cellRow": cell_row,
        "cellCol": cell_col,
        "status": status,
    }))
}

const ENTRY_COLUMNS: &str =
    "id, page_id, kind, user_id, user_name, content, block_id, cell_row, cell_col, status";

fn entries_list(
    conn: &Connection,
    params: &serde_json::Value,
    kind: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let actor = parse_actor(params)?;
    let page_id = get_required_str(params, "pageId")?;
    if !page_exists(conn, &page_id)? {
        return Err(HandlerErr::not_found("page not found"));
    }

    // Teachers moderate everything; a student sees only their own
    // submissions. Approved cell text is visible to everyone anyway,
    // because it lives in the page content by then.
    if actor.role == Role::Teacher {
        let sql = format!(
            "SELECT {} FROM notebook_entries
             WHERE page_id = ? AND kind = ?
             ORDER BY created_at, id",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
        stmt.query_map([page_id.as_str(), kind], entry_row_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)
    } else {
        let sql = format!(
            "SELECT {} FROM notebook_entries
             WHERE page_id = ? AND kind = ? AND user_id = ?
             ORDER BY created_at, id",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
        stmt.query_map([page_id.as_str(), kind, actor.user_id.as_str()], entry_row_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)
    }
}

fn entries_list_page(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "entries": entries_list(conn, params, "page")? }))
}

fn entries_list_cell(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "cellEntries": entries_list(conn, params, "cell")? }))
}

fn entry_submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_student(params)?;
    let page_id = get_required_str(params, "pageId")?;
    if !page_exists(conn, &page_id)? {
        return Err(HandlerErr::not_found("page not found"));
    }
    let content = get_required_str(params, "content")?.trim().to_string();
    if content.is_empty() {
        return Err(HandlerErr::bad_params("content must not be empty"));
    }

    let entry_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO notebook_entries(id, page_id, kind, user_id, user_name, content, status, created_at)
         VALUES(?, ?, 'page', ?, ?, ?, 'pending', ?)",
        (
            &entry_id,
            &page_id,
            &actor.user_id,
            &actor.user_name,
            &content,
            now_ms(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "entry": {
            "entryId": entry_id,
            "pageId": page_id,
            "kind": "page",
            "userId": actor.user_id,
            "userName": actor.user_name,
            "content": content,
            "blockId": null,
            "cellRow": null,
            "cellCol": null,
            "status": "pending",
        }
    }))
}

fn cell_entry_submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_student(params)?;
    let page_id = get_required_str(params, "pageId")?;
    if !page_exists(conn, &page_id)? {
        return Err(HandlerErr::not_found("page not found"));
    }
    let block_id = get_required_str(params, "blockId")?;
    let cell_row = get_required_i64(params, "cellRow")?;
    let cell_col = get_required_i64(params, "cellCol")?;
    if cell_row < 0 || cell_col < 0 {
        return Err(HandlerErr::bad_params("cell address must be non-negative"));
    }
    let text = get_required_str(params, "text")?.trim().to_string();
    if text.is_empty() {
        return Err(HandlerErr::bad_params("text must not be empty"));
    }

    // No submission-time exclusivity: any number of students may have a
    // pending entry on the same cell.
    let entry_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO notebook_entries(id, page_id, kind, user_id, user_name, content, block_id, cell_row, cell_col, status, created_at)
         VALUES(?, ?, 'cell', ?, ?, ?, ?, ?, ?, 'pending', ?)",
        (
            &entry_id,
            &page_id,
            &actor.user_id,
            &actor.user_name,
            &text,
            &block_id,
            cell_row,
            cell_col,
            now_ms(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "entry": {
            "entryId": entry_id,
            "pageId": page_id,
            "kind": "cell",
            "userId": actor.user_id,
            "userName": actor.user_name,
            "content": text,
            "blockId": block_id,
            "cellRow": cell_row,
            "cellCol": cell_col,
            "status": "pending",
        }
    }))
}

struct PendingEntry {
    page_id: String,
    content: String,
    block_id: Option<String>,
    cell_row: Option<i64>,
    cell_col: Option<i64>,
}

fn load_pending_entry(
    conn: &Connection,
    entry_id: &str,
    kind: &str,
) -> Result<PendingEntry, HandlerErr> {
    let row: Option<(PendingEntry, String)> = conn
        .query_row(
            "SELECT page_id, content, block_id, cell_row, cell_col, status
             FROM notebook_entries WHERE id = ? AND kind = ?",
            [entry_id, kind],
            |r| {
                Ok((
                    PendingEntry {
                        page_id: r.get(0)?,
                        content: r.get(1)?,
                        block_id: r.get(2)?,
                        cell_row: r.get(3)?,
                        cell_col: r.get(4)?,
                    },
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((entry, status)) = row else {
        return Err(HandlerErr::not_found("entry not found"));
    };
    if status != "pending" {
        return Err(HandlerErr::new("already_reviewed", "entry is not pending"));
    }
    Ok(entry)
}

fn reviewed_entry_json(conn: &Connection, entry_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM notebook_entries WHERE id = ?",
        ENTRY_COLUMNS
    );
    conn.query_row(&sql, [entry_id], entry_row_json)
        .map_err(HandlerErr::db)
}

fn entry_review(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_teacher(params)?;
    let entry_id = get_required_str(params, "entryId")?;
    let approved = get_required_bool(params, "approved")?;
    load_pending_entry(conn, &entry_id, "page")?;

    // Page-level approval is terminal: the status flips and the text
    // stays an entry. Pulling it into the page is a manual author move.
    let status = if approved { "approved" } else { "rejected" };
    conn.execute(
        "UPDATE notebook_entries SET status = ?, reviewed_by = ?, reviewed_at = ? WHERE id = ?",
        (status, &actor.user_id, now_ms(), &entry_id),
    )
    .map_err(|e| HandlerErr::new("db_write_failed", e.to_string()))?;

    Ok(json!({ "entry": reviewed_entry_json(conn, &entry_id)? }))
}

/// Cell-entry review. Approval must leave no externally observable state
/// in which the entry is approved but its text missing from the page (or
/// the reverse), so the status flip and the content splice commit in one
/// transaction.
fn cell_entry_review(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_teacher(params)?;
    let entry_id = get_required_str(params, "entryId")?;
    let approved = get_required_bool(params, "approved")?;
    let entry = load_pending_entry(conn, &entry_id, "cell")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let mut write_back_applied = false;
    let mut content_value: Option<serde_json::Value> = None;
    if approved {
        let content_text: String = tx
            .query_row(
                "SELECT content FROM notebook_pages WHERE id = ?",
                [&entry.page_id],
                |r| r.get(0),
            )
            .map_err(HandlerErr::db)?;
        let mut content = blocks::parse_content(&parse_content_text(&content_text)?)
            .map_err(|e| HandlerErr::new("corrupt_content", e))?;
        if let (Some(block_id), Some(row), Some(col)) =
            (entry.block_id.as_deref(), entry.cell_row, entry.cell_col)
        {
            if row >= 0 && col >= 0 {
                // A stale address (the author restructured the table since
                // submission) skips the splice; the entry still resolves
                // and the response flags it for the reviewer.
                write_back_applied = blocks::set_cell_text(
                    &mut content,
                    block_id,
                    row as usize,
                    col as usize,
                    &entry.content,
                );
            }
        }
        if write_back_applied {
            let value = blocks::to_value(&content);
            tx.execute(
                "UPDATE notebook_pages SET content = ?, updated_at = ? WHERE id = ?",
                (value.to_string(), now_ms(), &entry.page_id),
            )
            .map_err(|e| HandlerErr::new("db_write_failed", e.to_string()))?;
            content_value = Some(value);
        } else {
            content_value = Some(blocks::to_value(&content));
        }
    }

    let status = if approved { "approved" } else { "rejected" };
    tx.execute(
        "UPDATE notebook_entries SET status = ?, reviewed_by = ?, reviewed_at = ? WHERE id = ?",
        (status, &actor.user_id, now_ms(), &entry_id),
    )
    .map_err(|e| HandlerErr::new("db_write_failed", e.to_string()))?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let mut result = json!({
        "entry": reviewed_entry_json(conn, &entry_id)?,
        "writeBackApplied": write_back_applied,
    });
    if let Some(content) = content_value {
        result["content"] = content;
    }
    Ok(result)
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notebook.listPages" => Some(with_conn(state, req, pages_list)),
        "notebook.createPage" => Some(with_conn(state, req, page_create)),
        "notebook.deletePage" => Some(with_conn(state, req, page_delete)),
        "notebook.updateTitle" => Some(with_conn(state, req, page_update_title)),
        "notebook.updateContent" => Some(with_conn(state, req, page_update_content)),
        "notebook.listEntries" => Some(with_conn(state, req, entries_list_page)),
        "notebook.submitEntry" => Some(with_conn(state, req, entry_submit)),
        "notebook.reviewEntry" => Some(with_conn(state, req, entry_review)),
        "notebook.listCellEntries" => Some(with_conn(state, req, entries_list_cell)),
        "notebook.submitCellEntry" => Some(with_conn(state, req, cell_entry_submit)),
        "notebook.reviewCellEntry" => Some(with_conn(state, req, cell_entry_review)),
        _ => None,
    }
}
