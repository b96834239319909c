use serde::{Deserialize, Serialize};

/// Kind of a single diff line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Added,
    Removed,
    Context,
}

/// One line inside a hunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub kind: LineKind,
    pub content: String,
}

/// A contiguous block of changed lines within one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    /// 1-based line number in the new file where the hunk starts.
    pub start_line: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// Number of added/removed lines (context lines do not count as change).
    pub fn changed_line_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| l.kind != LineKind::Context)
            .count()
    }

    /// Line range covered by this hunk in the new file, inclusive.
    pub fn line_range(&self) -> (usize, usize) {
        let len = self.lines.len().max(1);
        (self.start_line, self.start_line + len - 1)
    }
}

/// One changed file with its hunks, as handed over by diff retrieval.
///
/// The core treats this as already-parsed input; no diff text parsing
/// happens on this side of the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffFile {
    pub path: String,

    /// File metadata supplied by the retrieval layer.
    #[serde(default)]
    pub is_test: bool,
    #[serde(default)]
    pub is_config: bool,

    pub hunks: Vec<DiffHunk>,
}

impl DiffFile {
    pub fn changed_line_count(&self) -> usize {
        self.hunks.iter().map(DiffHunk::changed_line_count).sum()
    }

    /// File extension, lowercase, without the leading dot.
    pub fn extension(&self) -> Option<&str> {
        self.path.rsplit_once('.').map(|(_, ext)| ext)
    }
}
