use std::collections::BTreeMap;

use crate::error::Result;
use crate::notebook::{Cell, CellType, Notebook};

/// Mapping of old text to new text, applied to each cell independently in
/// the map's iteration order.
pub type Replacements = BTreeMap<String, String>;

/// A tree-editing pass over a notebook's cell sequence.
///
/// `preprocess` visits every cell in document order exactly once, then runs
/// the finishing pass. Implementations may hold per-invocation state between
/// the two phases, so an instance must not be shared across documents that
/// are processed concurrently.
pub trait Preprocessor {
    /// Visit one cell. `index` is the cell's position in the document.
    fn preprocess_cell(&mut self, cell: &mut Cell, index: usize) -> Result<()>;

    /// Called once after every cell has been visited. Structural edits to
    /// the cell sequence belong here, not in `preprocess_cell`.
    fn finish(&mut self, _notebook: &mut Notebook) -> Result<()> {
        Ok(())
    }

    /// Run the full pass over a notebook.
    fn preprocess(&mut self, notebook: &mut Notebook) -> Result<()> {
        for (index, cell) in notebook.cells.iter_mut().enumerate() {
            self.preprocess_cell(cell, index)?;
        }
        self.finish(notebook)
    }
}

/// Replaces given strings in the source of every code cell.
///
/// Each map entry is applied as a literal (non-regex) substring replacement
/// across the entire source text. Non-code cells pass through unmodified,
/// and an entry that matches nothing is a no-op. The pass is idempotent only
/// if no replacement value itself contains another key.
#[derive(Debug, Clone, Default)]
pub struct ReplaceCodeInputStrings {
    replacements: Replacements,
}

impl ReplaceCodeInputStrings {
    pub fn new(replacements: Replacements) -> Self {
        Self { replacements }
    }
}

impl Preprocessor for ReplaceCodeInputStrings {
    fn preprocess_cell(&mut self, cell: &mut Cell, _index: usize) -> Result<()> {
        if cell.cell_type == CellType::Code {
            for (old_text, new_text) in &self.replacements {
                cell.source = cell.source.replace(old_text, new_text);
            }
        }
        Ok(())
    }
}

/// Deletes every code cell whose source contains a marker string.
///
/// The pass runs in two phases: detection records the index of each matching
/// code cell while visiting in document order, and the finishing pass then
/// deletes the recorded indices highest-first, so a removal never shifts a
/// lower index that is still pending. Markdown and raw cells are never
/// matched, even when they contain the marker text. Instantiate fresh per
/// document: the pending-index list is per-instance state.
#[derive(Debug, Clone)]
pub struct RemoveTaggedCells {
    tag: String,
    pending: Vec<usize>,
}

impl RemoveTaggedCells {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            pending: Vec::new(),
        }
    }
}

impl Preprocessor for RemoveTaggedCells {
    fn preprocess_cell(&mut self, cell: &mut Cell, index: usize) -> Result<()> {
        if cell.cell_type == CellType::Code && cell.source.contains(&self.tag) {
            self.pending.push(index);
        }
        Ok(())
    }

    fn finish(&mut self, notebook: &mut Notebook) -> Result<()> {
        // Indices were recorded ascending; drain from the back so every
        // pending index stays valid while earlier removals happen.
        while let Some(index) = self.pending.pop() {
            notebook.cells.remove(index);
        }
        Ok(())
    }
}
