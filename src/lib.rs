// nbsampleutils - Utilities for executing Jupyter notebooks and exporting
// them to Markdown, for producing sample documentation from executable
// notebooks.

pub mod error;
pub mod execute;
pub mod export;
pub mod notebook;
pub mod preprocess;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use execute::{
    run_from_path, run_notebook, ExecuteOptions, NotebookExecutor, PythonExecutor, RunOptions,
};
pub use export::{
    export_from_path, export_notebook, strip_styles, ExportOptions, FilesWriter, MarkdownExporter,
    NotebookConverter, Resources,
};
pub use notebook::{Cell, CellType, Notebook, Output};
pub use preprocess::{Preprocessor, RemoveTaggedCells, ReplaceCodeInputStrings, Replacements};
