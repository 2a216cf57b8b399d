use serde::{Deserialize, Serialize};

/// Ordered block structure of one notebook page. Stored as JSON in the
/// page row; both the author's editor and the cell write-back path go
/// through this model so a malformed document is caught at parse time
/// instead of producing a partial splice.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageContent {
    #[serde(default)]
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Paragraph {
        id: String,
        #[serde(default)]
        text: String,
    },
    Table {
        id: String,
        #[serde(default)]
        rows: Vec<Vec<TableCell>>,
    },
}

impl Block {
    pub fn id(&self) -> &str {
        match self {
            Block::Paragraph { id, .. } => id,
            Block::Table { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TableCell {
    #[serde(default)]
    pub text: String,
}

/// Address of one table cell inside a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellAddr {
    pub block_id: String,
    pub row: usize,
    pub col: usize,
}

pub fn parse_content(value: &serde_json::Value) -> Result<PageContent, String> {
    serde_json::from_value(value.clone()).map_err(|e| e.to_string())
}

pub fn to_value(content: &PageContent) -> serde_json::Value {
    serde_json::to_value(content).unwrap_or_else(|_| serde_json::json!({ "blocks": [] }))
}

fn find_cell<'a>(
    content: &'a PageContent,
    block_id: &str,
    row: usize,
    col: usize,
) -> Option<&'a TableCell> {
    for b in &content.blocks {
        if let Block::Table { id, rows } = b {
            if id == block_id {
                return rows.get(row)?.get(col);
            }
        }
    }
    None
}

pub fn cell_text<'a>(
    content: &'a PageContent,
    block_id: &str,
    row: usize,
    col: usize,
) -> Option<&'a str> {
    find_cell(content, block_id, row, col).map(|c| c.text.as_str())
}

/// A cell is open for contribution when it exists and holds no visible
/// text. Always recomputed from the current document: a teacher edit can
/// fill or empty a cell independent of the entry flow, so caching this
/// would go stale.
pub fn cell_is_open(content: &PageContent, block_id: &str, row: usize, col: usize) -> bool {
    match cell_text(content, block_id, row, col) {
        Some(text) => text.trim().is_empty(),
        None => false,
    }
}

/// Splices `text` into the addressed cell. Returns false when the block
/// or cell no longer exists (the document was restructured since the
/// address was taken); the caller decides how to resolve that.
pub fn set_cell_text(
    content: &mut PageContent,
    block_id: &str,
    row: usize,
    col: usize,
    text: &str,
) -> bool {
    for b in &mut content.blocks {
        if let Block::Table { id, rows } = b {
            if id != block_id {
                continue;
            }
            if let Some(cell) = rows.get_mut(row).and_then(|r| r.get_mut(col)) {
                cell.text = text.to_string();
                return true;
            }
            return false;
        }
    }
    false
}

/// All currently open cells of a page, in document order.
pub fn open_cells(content: &PageContent) -> Vec<CellAddr> {
    let mut out = Vec::new();
    for b in &content.blocks {
        if let Block::Table { id, rows } = b {
            for (r, cells) in rows.iter().enumerate() {
                for (c, cell) in cells.iter().enumerate() {
                    if cell.text.trim().is_empty() {
                        out.push(CellAddr {
                            block_id: id.clone(),
                            row: r,
                            col: c,
                        });
                    }
                }
            }
        }
    }
    out
}
