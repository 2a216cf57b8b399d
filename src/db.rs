use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("classroom.sqlite3");
    let conn = Connection::open(db_path)?;
    apply_schema(&conn)?;
    Ok(conn)
}

fn apply_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS room_state(
            room_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            updated_by TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notebook_pages(
            id TEXT PRIMARY KEY,
            room_id TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            created_by TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notebook_pages_room ON notebook_pages(room_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notebook_entries(
            id TEXT PRIMARY KEY,
            page_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            user_id TEXT NOT NULL,
            user_name TEXT NOT NULL,
            content TEXT NOT NULL,
            block_id TEXT,
            cell_row INTEGER,
            cell_col INTEGER,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            reviewed_by TEXT,
            reviewed_at INTEGER,
            FOREIGN KEY(page_id) REFERENCES notebook_pages(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notebook_entries_page ON notebook_entries(page_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notebook_entries_user ON notebook_entries(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notebook_entries_page_status ON notebook_entries(page_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quizzes(
            id TEXT PRIMARY KEY,
            room_id TEXT NOT NULL,
            title TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quizzes_room ON quizzes(room_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quiz_questions(
            id TEXT PRIMARY KEY,
            quiz_id TEXT NOT NULL,
            text TEXT NOT NULL,
            qtype TEXT NOT NULL,
            choices TEXT,
            correct_answer TEXT,
            time_limit INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(quiz_id) REFERENCES quizzes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_questions_quiz ON quiz_questions(quiz_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_questions_quiz_sort ON quiz_questions(quiz_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quiz_answers(
            id TEXT PRIMARY KEY,
            question_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            user_name TEXT NOT NULL,
            answer_text TEXT NOT NULL,
            is_correct INTEGER,
            scored_by TEXT,
            scored_at INTEGER,
            created_at INTEGER NOT NULL,
            FOREIGN KEY(question_id) REFERENCES quiz_questions(id),
            UNIQUE(question_id, user_id)
        )",
        [],
    )?;
    ensure_quiz_answers_scoring_columns(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_answers_question ON quiz_answers(question_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_answers_user ON quiz_answers(user_id)",
        [],
    )?;

    Ok(())
}

// Early workspaces stored only is_correct; grading provenance was added later.
fn ensure_quiz_answers_scoring_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "quiz_answers", "scored_by")? {
        conn.execute("ALTER TABLE quiz_answers ADD COLUMN scored_by TEXT", [])?;
    }
    if !table_has_column(conn, "quiz_answers", "scored_at")? {
        conn.execute("ALTER TABLE quiz_answers ADD COLUMN scored_at INTEGER", [])?;
    }
    Ok(())
}

/// In-memory workspace with the full schema, for in-process tests.
#[cfg(test)]
pub fn open_in_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    apply_schema(&conn).expect("apply schema");
    conn
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
