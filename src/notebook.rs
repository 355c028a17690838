use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::error::{Error, Result};

/// An in-memory nbformat v4 notebook: an ordered sequence of cells plus
/// document metadata. Cell order is significant and is preserved everywhere
/// except where a preprocessor explicitly removes a cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notebook {
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub nbformat: u32,
    pub nbformat_minor: u32,
}

impl Notebook {
    /// Create an empty nbformat 4.5 notebook.
    pub fn new(cells: Vec<Cell>) -> Self {
        Self {
            cells,
            metadata: Map::new(),
            nbformat: 4,
            nbformat_minor: 5,
        }
    }

    /// Load a notebook from a local `.ipynb` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("loading notebook from {}", path.display());
        let file = File::open(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build a notebook with one code cell per source fragment,
    /// e.g. `Notebook::from_code_cells(["print(2 + 2)"])`.
    pub fn from_code_cells<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(sources.into_iter().map(Cell::code).collect())
    }
}

/// A single unit of content within a notebook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cell {
    /// Cell type determines behavior: only code cells are executed,
    /// substituted into, or matched for marker-based deletion.
    pub cell_type: CellType,

    /// nbformat cell id (absent in pre-4.5 documents).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Source text. nbformat persists this as either a string or a list of
    /// line strings; both forms deserialize to one string.
    #[serde(default, deserialize_with = "multiline::deserialize")]
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,

    /// Captured outputs (code cells only). A cell that was never executed
    /// may lack the attribute entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<Output>>,
}

impl Cell {
    /// Create a new code cell with a fresh cell id and empty outputs.
    pub fn code(source: impl Into<String>) -> Self {
        Self {
            cell_type: CellType::Code,
            id: Some(Ulid::new().to_string()),
            metadata: Map::new(),
            source: source.into(),
            execution_count: None,
            outputs: Some(Vec::new()),
        }
    }

    /// Create a new markdown cell with a fresh cell id.
    pub fn markdown(source: impl Into<String>) -> Self {
        Self {
            cell_type: CellType::Markdown,
            id: Some(Ulid::new().to_string()),
            metadata: Map::new(),
            source: source.into(),
            execution_count: None,
            outputs: None,
        }
    }

    /// Create a new raw cell with a fresh cell id.
    pub fn raw(source: impl Into<String>) -> Self {
        Self {
            cell_type: CellType::Raw,
            id: Some(Ulid::new().to_string()),
            metadata: Map::new(),
            source: source.into(),
            execution_count: None,
            outputs: None,
        }
    }

    /// Return the output text of this cell: the concatenation, in output
    /// order, of stream `text` fields and `text/plain` data entries.
    ///
    /// A cell with no `outputs` attribute yields an empty string rather than
    /// an error; cells are commonly inspected before execution.
    pub fn output_text(&self) -> String {
        let Some(outputs) = &self.outputs else {
            return String::new();
        };
        let mut text = String::new();
        for output in outputs {
            match output {
                Output::Stream { text: chunk, .. } => text.push_str(chunk),
                Output::ExecuteResult { data, .. } | Output::DisplayData { data, .. } => {
                    if let Some(plain) = data.get("text/plain").and_then(mime_text) {
                        text.push_str(&plain);
                    }
                }
                Output::Error { .. } => {}
            }
        }
        text
    }
}

/// Cell type tag, matching the nbformat `cell_type` field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

/// A captured result attached to an executed code cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    /// Text written to stdout or stderr (`name` distinguishes the two).
    Stream {
        name: String,
        #[serde(default, deserialize_with = "multiline::deserialize")]
        text: String,
    },

    /// The value of the cell's final expression, as MIME representations.
    ExecuteResult {
        #[serde(default)]
        execution_count: Option<u64>,
        data: BTreeMap<String, Value>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    /// Rich display output (plots, rendered dataframes).
    DisplayData {
        data: BTreeMap<String, Value>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    /// An uncaught exception captured during execution.
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

/// Flatten a MIME representation to text. nbformat stores text-bearing MIME
/// values as either one string or a list of line strings.
pub(crate) fn mime_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => Some(parts.iter().filter_map(Value::as_str).collect()),
        _ => None,
    }
}

mod multiline {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Text {
        Joined(String),
        Lines(Vec<String>),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Text::deserialize(deserializer)? {
            Text::Joined(text) => text,
            Text::Lines(lines) => lines.concat(),
        })
    }
}
