use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::api::Role;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_optional_bool, get_required_bool, get_required_i64, get_required_str, now_ms, parse_actor,
    require_teacher,
};
use crate::ipc::types::{AppState, Request};

fn quiz_exists(conn: &Connection, quiz_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM quizzes WHERE id = ?", [quiz_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

fn quiz_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let room_id = get_required_str(params, "roomId")?;
    let mut stmt = conn
        .prepare(
            "SELECT
               q.id,
               q.title,
               q.created_by,
               (SELECT COUNT(*) FROM quiz_questions qq WHERE qq.quiz_id = q.id) AS question_count
             FROM quizzes q
             WHERE q.room_id = ?
             ORDER BY q.created_at, q.id",
        )
        .map_err(HandlerErr::db)?;
    let quizzes = stmt
        .query_map([&room_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let created_by: String = row.get(2)?;
            let question_count: i64 = row.get(3)?;
            Ok(json!({
                "quizId": id,
                "roomId": room_id,
                "title": title,
                "createdBy": created_by,
                "questionCount": question_count,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "quizzes": quizzes }))
}

fn quiz_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_teacher(params)?;
    let room_id = get_required_str(params, "roomId")?;
    let title = get_required_str(params, "title")?.trim().to_string();
    if title.is_empty() {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }

    let quiz_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO quizzes(id, room_id, title, created_by, created_at) VALUES(?, ?, ?, ?, ?)",
        (&quiz_id, &room_id, &title, &actor.user_id, now_ms()),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "quiz": {
            "quizId": quiz_id,
            "roomId": room_id,
            "title": title,
            "createdBy": actor.user_id,
            "questionCount": 0,
        }
    }))
}

fn quiz_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_teacher(params)?;
    let quiz_id = get_required_str(params, "quizId")?;
    if !quiz_exists(conn, &quiz_id)? {
        return Err(HandlerErr::not_found("quiz not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    tx.execute(
        "DELETE FROM quiz_answers
         WHERE question_id IN (SELECT id FROM quiz_questions WHERE quiz_id = ?)",
        [&quiz_id],
    )
    .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.execute("DELETE FROM quiz_questions WHERE quiz_id = ?", [&quiz_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.execute("DELETE FROM quizzes WHERE id = ?", [&quiz_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

fn question_add(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_teacher(params)?;
    let quiz_id = get_required_str(params, "quizId")?;
    if !quiz_exists(conn, &quiz_id)? {
        return Err(HandlerErr::not_found("quiz not found"));
    }
    let text = get_required_str(params, "text")?.trim().to_string();
    if text.is_empty() {
        return Err(HandlerErr::bad_params("text must not be empty"));
    }
    let qtype = get_required_str(params, "type")?;
    let time_limit = get_required_i64(params, "timeLimit")?;
    if time_limit <= 0 {
        return Err(HandlerErr::bad_params("timeLimit must be positive"));
    }

    let choices: Vec<String> = match params.get("choices") {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|_| HandlerErr::bad_params("choices must be a string array"))?,
        None => Vec::new(),
    };
    let correct_answer = params
        .get("correctAnswer")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    match qtype.as_str() {
        "text" => {}
        "multiple_choice" => {
            if choices.len() < 2 {
                return Err(HandlerErr::bad_params(
                    "multiple_choice needs at least two choices",
                ));
            }
            let Some(correct) = correct_answer.as_deref() else {
                return Err(HandlerErr::bad_params("multiple_choice needs correctAnswer"));
            };
            if !choices.iter().any(|c| c == correct) {
                return Err(HandlerErr::bad_params(
                    "correctAnswer must be one of the choices",
                ));
            }
        }
        other => {
            return Err(HandlerErr::bad_params(format!(
                "unknown question type: {}",
                other
            )))
        }
    }

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM quiz_questions WHERE quiz_id = ?",
            [&quiz_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;

    let question_id = Uuid::new_v4().to_string();
    let choices_text = if choices.is_empty() {
        None
    } else {
        Some(json!(choices).to_string())
    };
    conn.execute(
        "INSERT INTO quiz_questions(id, quiz_id, text, qtype, choices, correct_answer, time_limit, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &question_id,
            &quiz_id,
            &text,
            &qtype,
            &choices_text,
            &correct_answer,
            time_limit,
            next_sort,
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "question": {
            "questionId": question_id,
            "text": text,
            "type": qtype,
            "choices": choices,
            "correctAnswer": correct_answer,
            "timeLimit": time_limit,
        }
    }))
}

fn question_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_teacher(params)?;
    let question_id = get_required_str(params, "questionId")?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM quiz_questions WHERE id = ?",
            [&question_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("question not found"));
    }

    // Answers go with their question; orphaned answers would otherwise
    // accumulate invisibly.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM quiz_answers WHERE question_id = ?", [&question_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.execute("DELETE FROM quiz_questions WHERE id = ?", [&question_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

fn answer_row_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let question_id: String = row.get(1)?;
    let user_id: String = row.get(2)?;
    let user_name: String = row.get(3)?;
    let answer_text: String = row.get(4)?;
    let is_correct: Option<i64> = row.get(5)?;
    let scored_by: Option<String> = row.get(6)?;
    let scored_at: Option<i64> = row.get(7)?;
    Ok(json!({
        "answerId": id,
        "questionId": question_id,
        "userId": user_id,
        "userName": user_name,
        "answerText": answer_text,
        "isCorrect": is_correct.map(|v| v != 0),
        "scoredBy": scored_by,
        "scoredAt": scored_at,
    }))
}

fn quiz_open(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = parse_actor(params)?;
    let quiz_id = get_required_str(params, "quizId")?;
    let include_answers = get_optional_bool(params, "includeAnswers").unwrap_or(false);

    let quiz = conn
        .query_row(
            "SELECT room_id, title, created_by FROM quizzes WHERE id = ?",
            [&quiz_id],
            |r| {
                let room_id: String = r.get(0)?;
                let title: String = r.get(1)?;
                let created_by: String = r.get(2)?;
                Ok(json!({
                    "quizId": quiz_id,
                    "roomId": room_id,
                    "title": title,
                    "createdBy": created_by,
                }))
            },
        )
        .optional()
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::not_found("quiz not found"))?;

    let expose_correct = actor.role == Role::Teacher;
    let mut stmt = conn
        .prepare(
            "SELECT id, text, qtype, choices, correct_answer, time_limit
             FROM quiz_questions
             WHERE quiz_id = ?
             ORDER BY sort_order",
        )
        .map_err(HandlerErr::db)?;
    let questions = stmt
        .query_map([&quiz_id], |row| {
            let id: String = row.get(0)?;
            let text: String = row.get(1)?;
            let qtype: String = row.get(2)?;
            let choices_text: Option<String> = row.get(3)?;
            let correct_answer: Option<String> = row.get(4)?;
            let time_limit: i64 = row.get(5)?;
            let choices: serde_json::Value = choices_text
                .as_deref()
                .and_then(|t| serde_json::from_str(t).ok())
                .unwrap_or_else(|| json!([]));
            Ok(json!({
                "questionId": id,
                "text": text,
                "type": qtype,
                "choices": choices,
                // The answer key never travels to a student client.
                "correctAnswer": if expose_correct { json!(correct_answer) } else { json!(null) },
                "timeLimit": time_limit,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut result = json!({ "quiz": quiz, "questions": questions });
    if include_answers {
        let answers = if actor.role == Role::Teacher {
            let mut stmt = conn
                .prepare(
                    "SELECT a.id, a.question_id, a.user_id, a.user_name, a.answer_text,
                            a.is_correct, a.scored_by, a.scored_at
                     FROM quiz_answers a
                     JOIN quiz_questions q ON q.id = a.question_id
                     WHERE q.quiz_id = ?
                     ORDER BY a.created_at, a.id",
                )
                .map_err(HandlerErr::db)?;
            stmt.query_map([&quiz_id], answer_row_json)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db)?
        } else {
            let mut stmt = conn
                .prepare(
                    "SELECT a.id, a.question_id, a.user_id, a.user_name, a.answer_text,
                            a.is_correct, a.scored_by, a.scored_at
                     FROM quiz_answers a
                     JOIN quiz_questions q ON q.id = a.question_id
                     WHERE q.quiz_id = ? AND a.user_id = ?
                     ORDER BY a.created_at, a.id",
                )
                .map_err(HandlerErr::db)?;
            stmt.query_map([&quiz_id, &actor.user_id], answer_row_json)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db)?
        };
        result["answers"] = json!(answers);
    }
    Ok(result)
}

fn answer_submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = parse_actor(params)?;
    let question_id = get_required_str(params, "questionId")?;
    let answer_text = get_required_str(params, "answerText")?.trim().to_string();
    if answer_text.is_empty() {
        return Err(HandlerErr::bad_params("answerText must not be empty"));
    }

    let question: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT qtype, correct_answer FROM quiz_questions WHERE id = ?",
            [&question_id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((qtype, correct_answer)) = question else {
        return Err(HandlerErr::not_found("question not found"));
    };

    // Multiple choice grades itself at submission; free text stays
    // ungraded until a teacher reviews it.
    let is_correct: Option<bool> = match qtype.as_str() {
        "multiple_choice" => {
            Some(correct_answer.as_deref().map(str::trim) == Some(answer_text.as_str()))
        }
        _ => None,
    };

    let answer_id = Uuid::new_v4().to_string();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO quiz_answers(id, question_id, user_id, user_name, answer_text, is_correct, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &answer_id,
            &question_id,
            &actor.user_id,
            &actor.user_name,
            &answer_text,
            is_correct.map(i64::from),
            now_ms(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    if inserted == 0 {
        return Err(HandlerErr::new(
            "duplicate_answer",
            "this question was already answered by this user",
        ));
    }

    Ok(json!({
        "answer": {
            "answerId": answer_id,
            "questionId": question_id,
            "userId": actor.user_id,
            "userName": actor.user_name,
            "answerText": answer_text,
            "isCorrect": is_correct,
            "scoredBy": null,
            "scoredAt": null,
        }
    }))
}

fn answer_grade(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_teacher(params)?;
    let answer_id = get_required_str(params, "answerId")?;
    let is_correct = get_required_bool(params, "isCorrect")?;

    let scored_at = now_ms();
    let updated = conn
        .execute(
            "UPDATE quiz_answers SET is_correct = ?, scored_by = ?, scored_at = ? WHERE id = ?",
            (i64::from(is_correct), &actor.user_id, scored_at, &answer_id),
        )
        .map_err(|e| HandlerErr::new("db_write_failed", e.to_string()))?;
    if updated == 0 {
        return Err(HandlerErr::not_found("answer not found"));
    }

    let answer = conn
        .query_row(
            "SELECT id, question_id, user_id, user_name, answer_text, is_correct, scored_by, scored_at
             FROM quiz_answers WHERE id = ?",
            [&answer_id],
            answer_row_json,
        )
        .map_err(HandlerErr::db)?;
    Ok(json!({ "answer": answer }))
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
        "quiz.list" => Some(with_conn(state, req, quiz_list)),
        "quiz.create" => Some(with_conn(state, req, quiz_create)),
        "quiz.delete" => Some(with_conn(state, req, quiz_delete)),
        "quiz.addQuestion" => Some(with_conn(state, req, question_add)),
        "quiz.deleteQuestion" => Some(with_conn(state, req, question_delete)),
        "quiz.open" => Some(with_conn(state, req, quiz_open)),
        "quiz.submitAnswer" => Some(with_conn(state, req, answer_submit)),
        "quiz.gradeAnswer" => Some(with_conn(state, req, answer_grade)),
        _ => None,
    }
}
