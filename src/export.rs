use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;
use scraper::{Html, Node, Selector};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::execute::NotebookExecutor;
use crate::notebook::{mime_text, CellType, Notebook, Output};
use crate::preprocess::Replacements;

/// Side-channel naming and assets collected while rendering one export.
/// Created fresh per export call, handed to the writer, then discarded.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    /// Base name used to key this export's assets.
    pub unique_key: String,

    /// Directory name, relative to the output directory, that holds
    /// extracted assets.
    pub output_files_dir: String,

    /// Extracted assets: path relative to the output directory -> bytes.
    pub outputs: BTreeMap<String, Vec<u8>>,
}

impl Resources {
    /// Derive resource naming for an export named `md_name`.
    pub fn for_name(md_name: &str) -> Self {
        Self {
            unique_key: md_name.to_string(),
            output_files_dir: format!("{md_name}-resources"),
            outputs: BTreeMap::new(),
        }
    }
}

/// A document-conversion engine rendering a notebook to text. Injected into
/// the export pipeline so tests can substitute a fake.
pub trait NotebookConverter {
    fn from_notebook(&self, notebook: &Notebook, resources: &mut Resources) -> Result<String>;
}

/// Renders a notebook to Markdown.
///
/// Markdown and raw cells pass through as text; code cells become fenced
/// `python` blocks. Outputs render by MIME preference: `text/html` and
/// `text/markdown` pass through raw, `image/png`/`image/jpeg` are decoded
/// into the resources bundle and referenced by relative link, and
/// `text/plain` (like stream and error text) is indented as a literal block.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownExporter;

impl NotebookConverter for MarkdownExporter {
    fn from_notebook(&self, notebook: &Notebook, resources: &mut Resources) -> Result<String> {
        let mut blocks: Vec<String> = Vec::new();

        for (cell_index, cell) in notebook.cells.iter().enumerate() {
            match cell.cell_type {
                CellType::Markdown | CellType::Raw => {
                    let text = cell.source.trim_end();
                    if !text.is_empty() {
                        blocks.push(text.to_string());
                    }
                }
                CellType::Code => {
                    blocks.push(format!("```python\n{}\n```", cell.source.trim_end()));
                    let Some(outputs) = &cell.outputs else {
                        continue;
                    };
                    for (output_index, output) in outputs.iter().enumerate() {
                        if let Some(block) =
                            render_output(output, cell_index, output_index, resources)?
                        {
                            blocks.push(block);
                        }
                    }
                }
            }
        }

        log::debug!(
            "rendered {} cells to markdown ({} resource assets)",
            notebook.cells.len(),
            resources.outputs.len()
        );
        Ok(blocks.join("\n\n") + "\n")
    }
}

fn render_output(
    output: &Output,
    cell_index: usize,
    output_index: usize,
    resources: &mut Resources,
) -> Result<Option<String>> {
    match output {
        Output::Stream { text, .. } => Ok(indented_block(text)),
        Output::Error {
            ename,
            evalue,
            traceback,
        } => {
            let text = if traceback.is_empty() {
                format!("{ename}: {evalue}")
            } else {
                traceback.concat()
            };
            Ok(indented_block(&text))
        }
        Output::ExecuteResult { data, .. } | Output::DisplayData { data, .. } => {
            render_data(data, cell_index, output_index, resources)
        }
    }
}

fn render_data(
    data: &BTreeMap<String, Value>,
    cell_index: usize,
    output_index: usize,
    resources: &mut Resources,
) -> Result<Option<String>> {
    // Richest representation wins; dataframe HTML in particular must pass
    // through raw so the style-stripping filter can see it.
    for mime in ["text/html", "text/markdown"] {
        if let Some(text) = data.get(mime).and_then(mime_text) {
            return Ok(Some(text.trim_end().to_string()));
        }
    }

    for (mime, ext) in [("image/png", "png"), ("image/jpeg", "jpeg")] {
        if let Some(encoded) = data.get(mime).and_then(mime_text) {
            let bytes = BASE64
                .decode(encoded.trim().replace('\n', ""))
                .map_err(|err| {
                    Error::Conversion(format!("undecodable {mime} output data: {err}"))
                })?;
            let filename = format!("output_{cell_index}_{output_index}.{ext}");
            let relative = format!("{}/{}", resources.output_files_dir, filename);
            resources.outputs.insert(relative.clone(), bytes);
            return Ok(Some(format!("![{ext}]({relative})")));
        }
    }

    if let Some(text) = data.get("text/plain").and_then(mime_text) {
        return Ok(indented_block(&text));
    }
    Ok(None)
}

/// Indent text four spaces per line so Markdown renders it literally.
fn indented_block(text: &str) -> Option<String> {
    let text = text.trim_end();
    if text.is_empty() {
        return None;
    }
    let indented: Vec<String> = text
        .lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("    {line}")
            }
        })
        .collect();
    Some(indented.join("\n"))
}

/// Strip presentation styling from an HTML fragment.
///
/// Removes every `<style>` element (including its contents) and clears all
/// attributes of `<table>` and `<tr>` elements, which drops inline dataframe
/// styling without touching table structure or cell content. Parsing is
/// permissive: input with no markup at all comes back unchanged. Idempotent.
pub fn strip_styles(html: &str) -> String {
    let mut fragment = Html::parse_fragment(html);

    // Same two-phase shape as the cell-deletion pass: collect node ids with
    // the tree borrowed immutably, then edit.
    let style_selector = Selector::parse("style").unwrap();
    let doomed: Vec<_> = fragment.select(&style_selector).map(|el| el.id()).collect();
    for id in doomed {
        if let Some(mut node) = fragment.tree.get_mut(id) {
            node.detach();
        }
    }

    let table_selector = Selector::parse("table, tr").unwrap();
    let styled: Vec<_> = fragment.select(&table_selector).map(|el| el.id()).collect();
    for id in styled {
        if let Some(mut node) = fragment.tree.get_mut(id) {
            if let Node::Element(element) = node.value() {
                element.attrs.clear();
            }
        }
    }

    fragment.root_element().inner_html()
}

/// Apply final output replacements. Unlike the input-side preprocessor,
/// patterns here have regular-expression semantics.
fn apply_output_replacements(text: &str, replacements: &Replacements) -> Result<String> {
    let mut output = text.to_string();
    for (pattern, replacement) in replacements {
        let re = Regex::new(pattern).map_err(|source| Error::Replacement {
            pattern: pattern.clone(),
            source,
        })?;
        output = re.replace_all(&output, replacement.as_str()).into_owned();
    }
    Ok(output)
}

/// Writes rendered text and its resource assets under a build directory.
#[derive(Debug, Clone)]
pub struct FilesWriter {
    build_directory: PathBuf,
}

impl FilesWriter {
    pub fn new(build_directory: impl Into<PathBuf>) -> Self {
        Self {
            build_directory: build_directory.into(),
        }
    }

    /// Write `{name}.md` plus every collected resource asset. Returns the
    /// path of the written Markdown file. A failure mid-write is surfaced
    /// as-is; partial results are not cleaned up.
    pub fn write(&self, text: &str, resources: &Resources, name: &str) -> Result<PathBuf> {
        let write_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| Error::Write { path, source }
        };

        fs::create_dir_all(&self.build_directory).map_err(write_err(&self.build_directory))?;

        let md_path = self.build_directory.join(format!("{name}.md"));
        fs::write(&md_path, text).map_err(write_err(&md_path))?;

        for (relative, bytes) in &resources.outputs {
            let target = self.build_directory.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(write_err(parent))?;
            }
            fs::write(&target, bytes).map_err(write_err(&target))?;
        }

        log::info!(
            "wrote {} and {} resource assets",
            md_path.display(),
            resources.outputs.len()
        );
        Ok(md_path)
    }
}

/// Options for exporting a notebook to Markdown.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Directory to write into. `export_from_path` defaults to the
    /// notebook's own directory.
    pub output_dir: Option<PathBuf>,

    /// Patterns (regular expressions) to replace in the rendered output.
    pub replacements: Option<Replacements>,

    /// Execution configuration, used when an executor is supplied.
    pub execute: crate::execute::ExecuteOptions,
}

/// Export a notebook to `{output_dir}/{md_name}.md` plus a sibling
/// `{md_name}-resources/` directory of extracted assets. Returns the path
/// of the written Markdown file.
pub fn export_notebook(
    notebook: &Notebook,
    converter: &dyn NotebookConverter,
    md_name: &str,
    output_dir: impl AsRef<Path>,
    replacements: Option<&Replacements>,
) -> Result<PathBuf> {
    let mut resources = Resources::for_name(md_name);
    let mut output = converter.from_notebook(notebook, &mut resources)?;

    // CSS styling is ignored by most Markdown renderers; drop it entirely.
    output = strip_styles(&output);

    if let Some(replacements) = replacements {
        output = apply_output_replacements(&output, replacements)?;
    }

    FilesWriter::new(output_dir.as_ref()).write(&output, &resources, md_name)
}

/// Load a notebook from `path`, optionally execute it, and export it to
/// Markdown. The Markdown name is the file stem, lowercased with spaces
/// replaced by dashes. Supplying an executor corresponds to "execute before
/// exporting"; `None` exports the document as persisted.
pub fn export_from_path(
    path: impl AsRef<Path>,
    executor: Option<&dyn NotebookExecutor>,
    options: &ExportOptions,
) -> Result<PathBuf> {
    let path = path.as_ref();
    let md_name = markdown_name(path);
    let output_dir = match &options.output_dir {
        Some(dir) => dir.clone(),
        None => path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
    };

    let mut notebook = Notebook::from_path(path)?;
    if let Some(executor) = executor {
        executor.execute(&mut notebook, &options.execute, path.parent())?;
    }

    export_notebook(
        &notebook,
        &MarkdownExporter,
        &md_name,
        output_dir,
        options.replacements.as_ref(),
    )
}

fn markdown_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
        .replace(' ', "-")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::Cell;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};
    use tempfile::TempDir;

    const DF_HTML: &str = r#"<div>
    <style scoped="">
    .dataframe tbody tr th {
            vertical-align: top;
        }
    </style>
    <table border="1" class="dataframe">
        <thead>
            <tr style="text-align: right;">
                <th></th><th>name</th><th>count</th>
            </tr>
        </thead>
        <tbody>
            <tr>
                <th>0</th><td>James</td><td>5001762</td>
            </tr>
            <tr>
                <th>1</th><td>John</td><td>4875934</td>
            </tr>
        </tbody>
    </table>
</div>
"#;

    #[test]
    fn test_strip_styles() {
        // Two concatenated styled tables, as rendered by dataframe output.
        let html = format!("{DF_HTML}{DF_HTML}");
        for target in ["<style", "style=", "border=\"1\""] {
            assert!(html.contains(target));
        }

        let result = strip_styles(&html);

        for target in ["<style", "style=", "border=\"1\""] {
            assert!(!result.contains(target), "{target} should be stripped");
        }
        // Table structure and cell content survive.
        assert!(result.contains("<table>"));
        assert!(result.contains("<td>James</td>"));
    }

    #[test]
    fn test_strip_styles_with_markdown_only_input() {
        let markdown = "## Markdown style header";
        assert_eq!(strip_styles(markdown), markdown);
    }

    #[test]
    fn test_strip_styles_is_idempotent() {
        let once = strip_styles(DF_HTML);
        assert_eq!(strip_styles(&once), once);
    }

    fn dataframe_cell() -> Cell {
        let mut cell = Cell::code("df.head()");
        cell.outputs = Some(vec![Output::ExecuteResult {
            execution_count: Some(1),
            data: BTreeMap::from([
                ("text/html".to_string(), json!(DF_HTML)),
                ("text/plain".to_string(), json!("   name    count")),
            ]),
            metadata: Map::new(),
        }]);
        cell
    }

    #[test]
    fn test_markdown_exporter_renders_cells_and_outputs() {
        let mut printed = Cell::code("print(2 + 2)");
        printed.outputs = Some(vec![Output::Stream {
            name: "stdout".to_string(),
            text: "4\n".to_string(),
        }]);

        let notebook = Notebook::new(vec![
            Cell::markdown("# Sample"),
            printed,
            dataframe_cell(),
        ]);

        let mut resources = Resources::for_name("sample");
        let output = MarkdownExporter
            .from_notebook(&notebook, &mut resources)
            .unwrap();

        assert!(output.contains("# Sample"));
        assert!(output.contains("```python\nprint(2 + 2)\n```"));
        assert!(output.contains("    4"));
        // HTML wins over text/plain so the style stripper can see it.
        assert!(output.contains("<table"));
        assert!(!output.contains("   name    count"));
    }

    #[test]
    fn test_markdown_exporter_extracts_image_resources() {
        let mut cell = Cell::code("plot()");
        cell.outputs = Some(vec![Output::DisplayData {
            data: BTreeMap::from([("image/png".to_string(), json!("aGVsbG8="))]),
            metadata: Map::new(),
        }]);
        let notebook = Notebook::new(vec![cell]);

        let mut resources = Resources::for_name("sample");
        let output = MarkdownExporter
            .from_notebook(&notebook, &mut resources)
            .unwrap();

        assert!(output.contains("![png](sample-resources/output_0_0.png)"));
        assert_eq!(
            resources.outputs.get("sample-resources/output_0_0.png"),
            Some(&b"hello".to_vec())
        );
    }

    #[test]
    fn test_markdown_exporter_rejects_bad_image_data() {
        let mut cell = Cell::code("plot()");
        cell.outputs = Some(vec![Output::DisplayData {
            data: BTreeMap::from([("image/png".to_string(), json!("not base64!"))]),
            metadata: Map::new(),
        }]);
        let notebook = Notebook::new(vec![cell]);

        let result = MarkdownExporter.from_notebook(&notebook, &mut Resources::for_name("x"));
        assert!(matches!(result, Err(Error::Conversion(_))));
    }

    #[test]
    fn test_skipped_cell_without_outputs_renders_source_only() {
        let mut cell = Cell::code("x = 1");
        cell.outputs = None;
        let notebook = Notebook::new(vec![cell]);

        let output = MarkdownExporter
            .from_notebook(&notebook, &mut Resources::for_name("x"))
            .unwrap();

        assert_eq!(output, "```python\nx = 1\n```\n");
    }

    #[test]
    fn test_apply_output_replacements_uses_patterns() {
        let replacements = Replacements::from([(
            "execution-[0-9]+".to_string(),
            "execution-id".to_string(),
        )]);

        let result =
            apply_output_replacements("run execution-12345 done", &replacements).unwrap();
        assert_eq!(result, "run execution-id done");
    }

    #[test]
    fn test_apply_output_replacements_invalid_pattern() {
        let replacements = Replacements::from([("[unclosed".to_string(), "x".to_string())]);

        let result = apply_output_replacements("text", &replacements);
        assert!(matches!(result, Err(Error::Replacement { .. })));
    }

    #[test]
    fn test_files_writer_writes_markdown_and_resources() {
        let temp_dir = TempDir::new().unwrap();
        let mut resources = Resources::for_name("sample");
        resources
            .outputs
            .insert("sample-resources/output_0_0.png".to_string(), vec![1, 2, 3]);

        let writer = FilesWriter::new(temp_dir.path());
        let md_path = writer.write("# body\n", &resources, "sample").unwrap();

        assert_eq!(md_path, temp_dir.path().join("sample.md"));
        assert_eq!(fs::read_to_string(&md_path).unwrap(), "# body\n");
        assert_eq!(
            fs::read(temp_dir.path().join("sample-resources/output_0_0.png")).unwrap(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_files_writer_unwritable_target() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("occupied");
        fs::write(&blocker, "a plain file, not a directory").unwrap();

        let writer = FilesWriter::new(&blocker);
        let result = writer.write("text", &Resources::for_name("x"), "x");

        assert!(matches!(result, Err(Error::Write { .. })));
    }

    #[test]
    fn test_export_notebook_strips_styles_and_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let notebook = Notebook::new(vec![Cell::markdown("# Names"), dataframe_cell()]);
        let replacements =
            Replacements::from([("James".to_string(), "REDACTED".to_string())]);

        let md_path = export_notebook(
            &notebook,
            &MarkdownExporter,
            "names",
            temp_dir.path(),
            Some(&replacements),
        )
        .unwrap();

        let written = fs::read_to_string(md_path).unwrap();
        assert!(!written.contains("<style"));
        assert!(!written.contains("style="));
        assert!(!written.contains("James"));
        assert!(written.contains("REDACTED"));
        assert!(written.contains("# Names"));
    }

    #[test]
    fn test_markdown_name_from_path() {
        let name = markdown_name(Path::new("/tmp/Sample tested notebook.ipynb"));
        assert_eq!(name, "sample-tested-notebook");
    }

    #[test]
    fn test_export_from_path_missing_file() {
        let result = export_from_path(
            "/does/not/exist.ipynb",
            None,
            &ExportOptions::default(),
        );
        assert!(matches!(result, Err(Error::Read { .. })));
    }
}
