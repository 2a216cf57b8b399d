use std::collections::HashMap;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::{Actor, Api, ApiError, Role};
use crate::blocks::{self, CellAddr, PageContent};
use crate::clock::Clock;
use crate::sync::Debounced;

/// Author edits coalesce into one persist per pause in typing.
pub const CONTENT_DEBOUNCE_MS: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub page_id: String,
    pub title: String,
    pub content: PageContent,
    pub created_by: String,
    pub updated_at: i64,
    #[serde(default)]
    pub pending_entries: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Page,
    Cell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Approved,
    Rejected,
}

/// A participant contribution awaiting (or past) moderation. Cell
/// entries additionally address one table cell of the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub entry_id: String,
    pub page_id: String,
    pub kind: EntryKind,
    pub user_id: String,
    pub user_name: String,
    pub content: String,
    #[serde(default)]
    pub block_id: Option<String>,
    #[serde(default)]
    pub cell_row: Option<i64>,
    #[serde(default)]
    pub cell_col: Option<i64>,
    pub status: EntryStatus,
}

impl Entry {
    pub fn cell_addr(&self) -> Option<CellAddr> {
        match (&self.block_id, self.cell_row, self.cell_col) {
            (Some(block_id), Some(row), Some(col)) if row >= 0 && col >= 0 => Some(CellAddr {
                block_id: block_id.clone(),
                row: row as usize,
                col: col as usize,
            }),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum NotebookError {
    Api(ApiError),
    /// Page mutation attempted by a non-author (student) client.
    NotAuthor,
    /// Entry submission attempted by the author; contributions come from
    /// participants only.
    AuthorCannotSubmit,
    EmptyTitle,
    EmptyContent,
    UnknownPage,
    MalformedResponse(String),
}

impl From<ApiError> for NotebookError {
    fn from(e: ApiError) -> Self {
        NotebookError::Api(e)
    }
}

impl std::fmt::Display for NotebookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotebookError::Api(e) => write!(f, "api error: {}", e),
            NotebookError::NotAuthor => write!(f, "author role required"),
            NotebookError::AuthorCannotSubmit => {
                write!(f, "the author edits directly instead of submitting entries")
            }
            NotebookError::EmptyTitle => write!(f, "title must not be empty"),
            NotebookError::EmptyContent => write!(f, "content must not be empty"),
            NotebookError::UnknownPage => write!(f, "page not loaded"),
            NotebookError::MalformedResponse(m) => write!(f, "malformed response: {}", m),
        }
    }
}

/// Outcome of a cell-entry review as reported by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct CellReviewOutcome {
    pub entry: Entry,
    /// False when the addressed block or cell no longer existed and the
    /// splice was skipped; the entry still resolves.
    pub write_back_applied: bool,
}

/// Client side of the shared notebook: an ordered page list owned by the
/// teacher, with moderated free-text and per-table-cell contributions
/// from students.
///
/// Same event-driven shape as the state channel: author edits are held
/// in per-page coalescing slots and `tick()` flushes whichever are due,
/// retrying failures with backoff.
pub struct NotebookCollaborationEngine<A: Api, C: Clock> {
    api: A,
    clock: C,
    room_id: String,
    actor: Actor,
    pages: Vec<Page>,
    entries: HashMap<String, Vec<Entry>>,
    pending_content: HashMap<String, Debounced<PageContent>>,
}

impl<A: Api, C: Clock> NotebookCollaborationEngine<A, C> {
    pub fn new(api: A, clock: C, room_id: &str, actor: Actor) -> Self {
        Self {
            api,
            clock,
            room_id: room_id.to_string(),
            actor,
            pages: Vec::new(),
            entries: HashMap::new(),
            pending_content: HashMap::new(),
        }
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page(&self, page_id: &str) -> Option<&Page> {
        self.pages.iter().find(|p| p.page_id == page_id)
    }

    /// Entries currently visible to this actor for a page (the server
    /// filters a student down to their own submissions).
    pub fn entries(&self, page_id: &str) -> &[Entry] {
        self.entries.get(page_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The single author gate for page mutations.
    fn ensure_author(&self) -> Result<(), NotebookError> {
        if self.actor.role != Role::Teacher {
            return Err(NotebookError::NotAuthor);
        }
        Ok(())
    }

    fn ensure_participant(&self) -> Result<(), NotebookError> {
        if self.actor.role == Role::Teacher {
            return Err(NotebookError::AuthorCannotSubmit);
        }
        Ok(())
    }

    // ---- pages ----

    pub fn load_pages(&mut self) -> Result<(), NotebookError> {
        let result = self.api.call(
            "notebook.listPages",
            json!({ "roomId": self.room_id, "actor": self.actor.to_json() }),
        )?;
        self.pages = serde_json::from_value(
            result.get("pages").cloned().unwrap_or_else(|| json!([])),
        )
        .map_err(|e| NotebookError::MalformedResponse(e.to_string()))?;
        Ok(())
    }

    pub fn create_page(&mut self, title: &str) -> Result<Page, NotebookError> {
        self.ensure_author()?;
        let title = title.trim();
        if title.is_empty() {
            return Err(NotebookError::EmptyTitle);
        }
        let result = self.api.call(
            "notebook.createPage",
            json!({
                "roomId": self.room_id,
                "title": title,
                "actor": self.actor.to_json(),
            }),
        )?;
        let page: Page = serde_json::from_value(
            result.get("page").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| NotebookError::MalformedResponse(e.to_string()))?;
        self.pages.push(page.clone());
        Ok(page)
    }

    pub fn delete_page(&mut self, page_id: &str) -> Result<(), NotebookError> {
        self.ensure_author()?;
        self.api.call(
            "notebook.deletePage",
            json!({ "pageId": page_id, "actor": self.actor.to_json() }),
        )?;
        self.pages.retain(|p| p.page_id != page_id);
        self.entries.remove(page_id);
        self.pending_content.remove(page_id);
        Ok(())
    }

    pub fn rename_page(&mut self, page_id: &str, title: &str) -> Result<(), NotebookError> {
        self.ensure_author()?;
        let title = title.trim();
        if title.is_empty() {
            return Err(NotebookError::EmptyTitle);
        }
        self.api.call(
            "notebook.updateTitle",
            json!({ "pageId": page_id, "title": title, "actor": self.actor.to_json() }),
        )?;
        if let Some(p) = self.pages.iter_mut().find(|p| p.page_id == page_id) {
            p.title = title.to_string();
        }
        Ok(())
    }

    /// Author edit: applied to the local page immediately, persisted
    /// after the debounce window like the state channel's writes.
    pub fn edit_content(
        &mut self,
        page_id: &str,
        content: PageContent,
    ) -> Result<(), NotebookError> {
        self.ensure_author()?;
        let Some(page) = self.pages.iter_mut().find(|p| p.page_id == page_id) else {
            return Err(NotebookError::UnknownPage);
        };
        page.content = content.clone();
        let now = self.clock.now_ms();
        self.pending_content
            .entry(page_id.to_string())
            .or_insert_with(|| Debounced::new(CONTENT_DEBOUNCE_MS))
            .schedule(content, now);
        Ok(())
    }

    /// Flushes due (or failed-and-due-again) content writes.
    pub fn tick(&mut self) {
        let now = self.clock.now_ms();
        let due: Vec<(String, PageContent, u32)> = self
            .pending_content
            .iter_mut()
            .filter_map(|(page_id, slot)| {
                slot.take_due(now)
                    .map(|(content, attempt)| (page_id.clone(), content, attempt))
            })
            .collect();
        for (page_id, content, attempt) in due {
            self.send_content(&page_id, content, attempt);
        }
    }

    /// Persists a page's buffered edit immediately.
    pub fn flush_content(&mut self, page_id: &str) {
        if let Some((content, attempt)) = self
            .pending_content
            .get_mut(page_id)
            .and_then(|slot| slot.take_now())
        {
            self.send_content(page_id, content, attempt);
        }
    }

    pub fn dirty_pages(&self) -> Vec<&str> {
        self.pending_content
            .iter()
            .filter(|(_, slot)| slot.is_pending())
            .map(|(page_id, _)| page_id.as_str())
            .collect()
    }

    fn send_content(&mut self, page_id: &str, content: PageContent, attempt: u32) {
        let result = self.api.call(
            "notebook.updateContent",
            json!({
                "pageId": page_id,
                "content": blocks::to_value(&content),
                "actor": self.actor.to_json(),
            }),
        );
        match result {
            Ok(_) => {}
            Err(ApiError::Transient(m)) => {
                let now = self.clock.now_ms();
                warn!("content write for page {} failed: {}", page_id, m);
                if let Some(slot) = self.pending_content.get_mut(page_id) {
                    slot.put_back_failed(content, attempt, now);
                }
            }
            Err(e @ ApiError::Rejected { .. }) => {
                log::error!("content write for page {} rejected: {}", page_id, e);
            }
        }
    }

    // ---- entries ----

    pub fn refresh_entries(&mut self, page_id: &str) -> Result<(), NotebookError> {
        let page_result = self.api.call(
            "notebook.listEntries",
            json!({ "pageId": page_id, "actor": self.actor.to_json() }),
        )?;
        let mut merged: Vec<Entry> = serde_json::from_value(
            page_result
                .get("entries")
                .cloned()
                .unwrap_or_else(|| json!([])),
        )
        .map_err(|e| NotebookError::MalformedResponse(e.to_string()))?;
        let cell_result = self.api.call(
            "notebook.listCellEntries",
            json!({ "pageId": page_id, "actor": self.actor.to_json() }),
        )?;
        let cells: Vec<Entry> = serde_json::from_value(
            cell_result
                .get("cellEntries")
                .cloned()
                .unwrap_or_else(|| json!([])),
        )
        .map_err(|e| NotebookError::MalformedResponse(e.to_string()))?;
        merged.extend(cells);
        self.entries.insert(page_id.to_string(), merged);
        Ok(())
    }

    pub fn submit_entry(&mut self, page_id: &str, content: &str) -> Result<Entry, NotebookError> {
        self.ensure_participant()?;
        let content = content.trim();
        if content.is_empty() {
            return Err(NotebookError::EmptyContent);
        }
        let result = self.api.call(
            "notebook.submitEntry",
            json!({
                "pageId": page_id,
                "content": content,
                "actor": self.actor.to_json(),
            }),
        )?;
        self.push_entry(page_id, &result)
    }

    pub fn submit_cell_entry(
        &mut self,
        page_id: &str,
        block_id: &str,
        row: usize,
        col: usize,
        text: &str,
    ) -> Result<Entry, NotebookError> {
        self.ensure_participant()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(NotebookError::EmptyContent);
        }
        let result = self.api.call(
            "notebook.submitCellEntry",
            json!({
                "pageId": page_id,
                "blockId": block_id,
                "cellRow": row,
                "cellCol": col,
                "text": text,
                "actor": self.actor.to_json(),
            }),
        )?;
        self.push_entry(page_id, &result)
    }

    fn push_entry(
        &mut self,
        page_id: &str,
        result: &serde_json::Value,
    ) -> Result<Entry, NotebookError> {
        let entry: Entry = serde_json::from_value(
            result.get("entry").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| NotebookError::MalformedResponse(e.to_string()))?;
        self.entries
            .entry(page_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(entry)
    }

    /// Moderation of a page-level entry: approval flips the status and
    /// nothing else; pulling the text into the page stays a manual
    /// author action.
    pub fn review_entry(&mut self, entry_id: &str, approve: bool) -> Result<Entry, NotebookError> {
        self.ensure_author()?;
        let result = self.api.call(
            "notebook.reviewEntry",
            json!({
                "entryId": entry_id,
                "approved": approve,
                "actor": self.actor.to_json(),
            }),
        )?;
        let entry: Entry = serde_json::from_value(
            result.get("entry").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| NotebookError::MalformedResponse(e.to_string()))?;
        self.replace_entry(&entry);
        Ok(entry)
    }

    /// Moderation of a cell entry. Approval splices the text into the
    /// addressed cell server-side, atomically with the status flip; the
    /// response carries the refreshed page content.
    pub fn review_cell_entry(
        &mut self,
        entry_id: &str,
        approve: bool,
    ) -> Result<CellReviewOutcome, NotebookError> {
        self.ensure_author()?;
        let result = self.api.call(
            "notebook.reviewCellEntry",
            json!({
                "entryId": entry_id,
                "approved": approve,
                "actor": self.actor.to_json(),
            }),
        )?;
        let entry: Entry = serde_json::from_value(
            result.get("entry").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| NotebookError::MalformedResponse(e.to_string()))?;
        let write_back_applied = result
            .get("writeBackApplied")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if let Some(content_value) = result.get("content") {
            if let Ok(content) = blocks::parse_content(content_value) {
                if let Some(p) = self.pages.iter_mut().find(|p| p.page_id == entry.page_id) {
                    p.content = content;
                }
            }
        }
        self.replace_entry(&entry);
        Ok(CellReviewOutcome {
            entry,
            write_back_applied,
        })
    }

    fn replace_entry(&mut self, entry: &Entry) {
        if let Some(list) = self.entries.get_mut(&entry.page_id) {
            if let Some(slot) = list.iter_mut().find(|e| e.entry_id == entry.entry_id) {
                *slot = entry.clone();
            }
        }
    }

    // ---- derived views ----

    /// Cells currently open for contribution, recomputed from the live
    /// document on every call.
    pub fn open_cells(&self, page_id: &str) -> Vec<CellAddr> {
        self.page(page_id)
            .map(|p| blocks::open_cells(&p.content))
            .unwrap_or_default()
    }

    /// How many pending entries target the given cell; drives the
    /// "N pending" affordance and the reviewer cycling through them.
    pub fn pending_cell_count(&self, page_id: &str, addr: &CellAddr) -> usize {
        self.entries(page_id)
            .iter()
            .filter(|e| {
                e.status == EntryStatus::Pending && e.cell_addr().as_ref() == Some(addr)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LocalApi;
    use crate::clock::ManualClock;
    use serde_json::Value;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Counts calls per method while delegating to the real workspace;
    /// lets the debounce assertions talk about network traffic.
    #[derive(Clone)]
    struct CountingApi {
        inner: LocalApi,
        counts: Rc<RefCell<HashMap<String, usize>>>,
    }

    impl CountingApi {
        fn new(inner: LocalApi) -> Self {
            Self {
                inner,
                counts: Rc::new(RefCell::new(HashMap::new())),
            }
        }

        fn count(&self, method: &str) -> usize {
            self.counts.borrow().get(method).copied().unwrap_or(0)
        }
    }

    impl Api for CountingApi {
        fn call(&mut self, method: &str, params: Value) -> Result<Value, ApiError> {
            *self.counts.borrow_mut().entry(method.to_string()).or_insert(0) += 1;
            self.inner.call(method, params)
        }
    }

    fn table_content() -> PageContent {
        blocks::parse_content(&serde_json::json!({
            "blocks": [
                { "type": "table", "id": "b1", "rows": [
                    [ { "text": "animal" }, { "text": "" } ],
                    [ { "text": "color" }, { "text": "" } ]
                ]}
            ]
        }))
        .expect("table content")
    }

    struct Fixture {
        clock: ManualClock,
        teacher: NotebookCollaborationEngine<CountingApi, ManualClock>,
        counting: CountingApi,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(0);
        let counting = CountingApi::new(LocalApi::in_memory());
        let mut teacher = NotebookCollaborationEngine::new(
            counting.clone(),
            clock.clone(),
            "room-1",
            Actor::teacher("t1", "Ms Frizzle"),
        );
        teacher.load_pages().expect("load pages");
        Fixture {
            clock,
            teacher,
            counting,
        }
    }

    fn student_engine(
        f: &Fixture,
        user_id: &str,
        name: &str,
    ) -> NotebookCollaborationEngine<CountingApi, ManualClock> {
        NotebookCollaborationEngine::new(
            f.counting.clone(),
            f.clock.clone(),
            "room-1",
            Actor::student(user_id, name),
        )
    }

    #[test]
    fn page_lifecycle_roundtrips() {
        let mut f = fixture();
        let page = f.teacher.create_page("Field Trip Notes").expect("create");
        f.teacher.rename_page(&page.page_id, "Trip Notes").expect("rename");

        let mut fresh = NotebookCollaborationEngine::new(
            f.counting.clone(),
            f.clock.clone(),
            "room-1",
            Actor::teacher("t1", "Ms Frizzle"),
        );
        fresh.load_pages().expect("load");
        assert_eq!(fresh.pages().len(), 1);
        assert_eq!(fresh.pages()[0].title, "Trip Notes");

        f.teacher.delete_page(&page.page_id).expect("delete");
        fresh.load_pages().expect("reload");
        assert!(fresh.pages().is_empty());
    }

    #[test]
    fn create_and_rename_validate_titles() {
        let mut f = fixture();
        assert!(matches!(
            f.teacher.create_page("  "),
            Err(NotebookError::EmptyTitle)
        ));
        let page = f.teacher.create_page("Notes").expect("create");
        assert!(matches!(
            f.teacher.rename_page(&page.page_id, ""),
            Err(NotebookError::EmptyTitle)
        ));
    }

    #[test]
    fn students_cannot_mutate_pages() {
        let mut f = fixture();
        let page = f.teacher.create_page("Notes").expect("create");
        let mut student = student_engine(&f, "s1", "Arnold");
        assert!(matches!(
            student.create_page("Mine"),
            Err(NotebookError::NotAuthor)
        ));
        assert!(matches!(
            student.edit_content(&page.page_id, PageContent::default()),
            Err(NotebookError::NotAuthor)
        ));
        assert!(matches!(
            student.delete_page(&page.page_id),
            Err(NotebookError::NotAuthor)
        ));
    }

    #[test]
    fn content_edits_coalesce_into_one_write() {
        let mut f = fixture();
        let page = f.teacher.create_page("Notes").expect("create");

        let mut content = table_content();
        f.teacher
            .edit_content(&page.page_id, content.clone())
            .expect("edit 1");
        f.clock.advance(300);
        f.teacher.tick();
        blocks::set_cell_text(&mut content, "b1", 0, 0, "animals");
        f.teacher
            .edit_content(&page.page_id, content.clone())
            .expect("edit 2");
        f.clock.advance(300);
        f.teacher.tick();
        assert_eq!(f.counting.count("notebook.updateContent"), 0);
        assert_eq!(f.teacher.dirty_pages(), vec![page.page_id.as_str()]);

        f.clock.advance(CONTENT_DEBOUNCE_MS);
        f.teacher.tick();
        assert_eq!(f.counting.count("notebook.updateContent"), 1);
        assert!(f.teacher.dirty_pages().is_empty());

        // The persisted document is the final edit, not an intermediate.
        let mut fresh = NotebookCollaborationEngine::new(
            f.counting.clone(),
            f.clock.clone(),
            "room-1",
            Actor::teacher("t1", "Ms Frizzle"),
        );
        fresh.load_pages().expect("load");
        assert_eq!(
            blocks::cell_text(&fresh.pages()[0].content, "b1", 0, 0),
            Some("animals")
        );
    }

    #[test]
    fn cell_approval_splices_text_and_resolves_entry() {
        let mut f = fixture();
        let page = f.teacher.create_page("Vocabulary").expect("create");
        f.teacher
            .edit_content(&page.page_id, table_content())
            .expect("edit");
        f.teacher.flush_content(&page.page_id);

        let mut student = student_engine(&f, "s1", "Arnold");
        student.load_pages().expect("load");
        let entry = student
            .submit_cell_entry(&page.page_id, "b1", 0, 1, "cat")
            .expect("submit");
        assert_eq!(entry.status, EntryStatus::Pending);

        f.teacher.refresh_entries(&page.page_id).expect("entries");
        let outcome = f
            .teacher
            .review_cell_entry(&entry.entry_id, true)
            .expect("review");
        assert!(outcome.write_back_applied);
        assert_eq!(outcome.entry.status, EntryStatus::Approved);
        // The engine's local copy was refreshed from the response...
        assert_eq!(
            blocks::cell_text(&f.teacher.page(&page.page_id).expect("page").content, "b1", 0, 1),
            Some("cat")
        );
        // ...and the server document agrees.
        student.load_pages().expect("reload");
        assert_eq!(
            blocks::cell_text(&student.pages()[0].content, "b1", 0, 1),
            Some("cat")
        );
    }

    #[test]
    fn sibling_entries_on_one_cell_stay_pending() {
        let mut f = fixture();
        let page = f.teacher.create_page("Vocabulary").expect("create");
        f.teacher
            .edit_content(&page.page_id, table_content())
            .expect("edit");
        f.teacher.flush_content(&page.page_id);

        let mut arnold = student_engine(&f, "s1", "Arnold");
        let mut phoebe = student_engine(&f, "s2", "Phoebe");
        let a = arnold
            .submit_cell_entry(&page.page_id, "b1", 0, 1, "cat")
            .expect("submit a");
        let b = phoebe
            .submit_cell_entry(&page.page_id, "b1", 0, 1, "dog")
            .expect("submit b");

        f.teacher.refresh_entries(&page.page_id).expect("entries");
        let addr = CellAddr {
            block_id: "b1".into(),
            row: 0,
            col: 1,
        };
        assert_eq!(f.teacher.pending_cell_count(&page.page_id, &addr), 2);

        let outcome = f.teacher.review_cell_entry(&b.entry_id, true).expect("review b");
        assert!(outcome.write_back_applied);
        assert_eq!(
            blocks::cell_text(&f.teacher.page(&page.page_id).expect("page").content, "b1", 0, 1),
            Some("dog")
        );

        // Approving one sibling neither approves nor rejects the other.
        f.teacher.refresh_entries(&page.page_id).expect("refresh");
        let statuses: HashMap<&str, EntryStatus> = f
            .teacher
            .entries(&page.page_id)
            .iter()
            .map(|e| (e.entry_id.as_str(), e.status))
            .collect();
        assert_eq!(statuses[a.entry_id.as_str()], EntryStatus::Pending);
        assert_eq!(statuses[b.entry_id.as_str()], EntryStatus::Approved);
        assert_eq!(f.teacher.pending_cell_count(&page.page_id, &addr), 1);
    }

    #[test]
    fn approving_against_a_restructured_page_skips_write_back() {
        let mut f = fixture();
        let page = f.teacher.create_page("Vocabulary").expect("create");
        f.teacher
            .edit_content(&page.page_id, table_content())
            .expect("edit");
        f.teacher.flush_content(&page.page_id);

        let mut student = student_engine(&f, "s1", "Arnold");
        let entry = student
            .submit_cell_entry(&page.page_id, "b1", 0, 1, "cat")
            .expect("submit");

        // The table disappears before review.
        f.teacher
            .edit_content(&page.page_id, PageContent::default())
            .expect("restructure");
        f.teacher.flush_content(&page.page_id);

        f.teacher.refresh_entries(&page.page_id).expect("entries");
        let outcome = f
            .teacher
            .review_cell_entry(&entry.entry_id, true)
            .expect("review");
        assert!(!outcome.write_back_applied);
        assert_eq!(outcome.entry.status, EntryStatus::Approved);
    }

    #[test]
    fn students_see_only_their_own_entries() {
        let mut f = fixture();
        let page = f.teacher.create_page("Notes").expect("create");
        let mut arnold = student_engine(&f, "s1", "Arnold");
        let mut phoebe = student_engine(&f, "s2", "Phoebe");
        arnold
            .submit_entry(&page.page_id, "I liked the volcano")
            .expect("submit");
        phoebe
            .submit_entry(&page.page_id, "More experiments please")
            .expect("submit");

        arnold.refresh_entries(&page.page_id).expect("refresh");
        assert_eq!(arnold.entries(&page.page_id).len(), 1);
        assert_eq!(arnold.entries(&page.page_id)[0].user_id, "s1");

        f.teacher.refresh_entries(&page.page_id).expect("refresh");
        assert_eq!(f.teacher.entries(&page.page_id).len(), 2);
    }

    #[test]
    fn page_entry_review_does_not_touch_content() {
        let mut f = fixture();
        let page = f.teacher.create_page("Notes").expect("create");
        f.teacher
            .edit_content(&page.page_id, table_content())
            .expect("edit");
        f.teacher.flush_content(&page.page_id);

        let mut student = student_engine(&f, "s1", "Arnold");
        let entry = student
            .submit_entry(&page.page_id, "free text thought")
            .expect("submit");
        f.teacher.refresh_entries(&page.page_id).expect("refresh");
        let reviewed = f.teacher.review_entry(&entry.entry_id, true).expect("review");
        assert_eq!(reviewed.status, EntryStatus::Approved);

        let mut fresh = NotebookCollaborationEngine::new(
            f.counting.clone(),
            f.clock.clone(),
            "room-1",
            Actor::teacher("t1", "Ms Frizzle"),
        );
        fresh.load_pages().expect("load");
        assert_eq!(fresh.pages()[0].content, table_content());
    }

    #[test]
    fn submission_validates_before_any_network_call() {
        let mut f = fixture();
        let page = f.teacher.create_page("Notes").expect("create");
        let mut student = student_engine(&f, "s1", "Arnold");
        let before = f.counting.count("notebook.submitEntry");
        assert!(matches!(
            student.submit_entry(&page.page_id, "   "),
            Err(NotebookError::EmptyContent)
        ));
        assert_eq!(f.counting.count("notebook.submitEntry"), before);
        assert!(matches!(
            f.teacher.submit_entry(&page.page_id, "hi"),
            Err(NotebookError::AuthorCannotSubmit)
        ));
    }

    #[test]
    fn open_cells_follow_the_live_document() {
        let mut f = fixture();
        let page = f.teacher.create_page("Vocabulary").expect("create");
        f.teacher
            .edit_content(&page.page_id, table_content())
            .expect("edit");
        assert_eq!(f.teacher.open_cells(&page.page_id).len(), 2);

        let mut content = table_content();
        blocks::set_cell_text(&mut content, "b1", 0, 1, "cat");
        f.teacher.edit_content(&page.page_id, content).expect("edit");
        // Derived from content alone; no entry or network involved.
        assert_eq!(f.teacher.open_cells(&page.page_id).len(), 1);
    }
}
