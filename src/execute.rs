use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::notebook::{CellType, Notebook, Output};
use crate::preprocess::{Preprocessor, ReplaceCodeInputStrings, Replacements};

/// Passthrough configuration for the execution engine.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Keep executing after a cell raises, capturing the error in the
    /// cell's outputs instead of failing the run. Defaults to false: stop
    /// and fail on the first uncaught cell error.
    pub allow_errors: bool,

    /// Overall execution deadline. Checked before each cell starts; when it
    /// has elapsed the run fails with [`Error::Timeout`] instead of running
    /// further cells. A cell already running cannot be interrupted, so a
    /// single non-terminating cell is not bounded by this deadline.
    pub timeout: Option<Duration>,
}

/// A cell-execution engine. Injected into the orchestrator so tests can
/// substitute a fake for the embedded interpreter.
pub trait NotebookExecutor {
    /// Execute every code cell of `notebook` in document order, mutating
    /// each executed cell's `outputs` in place. `workdir` is a hint for
    /// where relative paths in cell code should resolve.
    fn execute(
        &self,
        notebook: &mut Notebook,
        options: &ExecuteOptions,
        workdir: Option<&Path>,
    ) -> Result<()>;
}

/// Helper defined once per run; executes one cell in a shared namespace and
/// reports (stdout, stderr, final-expression repr, error) without raising.
const CELL_RUNNER: &str = r#"
import ast
import io
import sys
import traceback


def run_cell(source, env):
    stdout = io.StringIO()
    stderr = io.StringIO()
    result = None
    error = None
    prev_out, prev_err = sys.stdout, sys.stderr
    sys.stdout, sys.stderr = stdout, stderr
    try:
        tree = ast.parse(source, mode="exec")
        last_expr = None
        if tree.body and isinstance(tree.body[-1], ast.Expr):
            last_expr = ast.Expression(tree.body.pop().value)
        exec(compile(tree, "<cell>", "exec"), env)
        if last_expr is not None:
            value = eval(compile(last_expr, "<cell>", "eval"), env)
            if value is not None:
                result = repr(value)
    except Exception as exc:
        error = (
            type(exc).__name__,
            str(exc),
            traceback.format_exception(type(exc), exc, exc.__traceback__),
        )
    finally:
        sys.stdout, sys.stderr = prev_out, prev_err
    return (stdout.getvalue(), stderr.getvalue(), result, error)
"#;

type CellReply = (
    String,
    String,
    Option<String>,
    Option<(String, String, Vec<String>)>,
);

/// Executes code cells in the embedded Python interpreter.
///
/// All cells of one run share a single namespace, so assignments in earlier
/// cells are visible to later ones, mirroring a notebook kernel session.
/// Stdout/stderr become `stream` outputs, the final expression's `repr`
/// becomes an `execute_result` with `text/plain` data, and uncaught
/// exceptions become `error` outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonExecutor;

impl NotebookExecutor for PythonExecutor {
    fn execute(
        &self,
        notebook: &mut Notebook,
        options: &ExecuteOptions,
        workdir: Option<&Path>,
    ) -> Result<()> {
        Python::with_gil(|py| {
            let runner =
                PyModule::from_code_bound(py, CELL_RUNNER, "nb_cell_runner.py", "nb_cell_runner")?;
            let run_cell = runner.getattr("run_cell")?;
            let env = PyDict::new_bound(py);

            let os = py.import_bound("os")?;
            let prev_dir = match workdir {
                Some(dir) => {
                    let prev: String = os.getattr("getcwd")?.call0()?.extract()?;
                    log::debug!("executing notebook from {}", dir.display());
                    os.getattr("chdir")?.call1((dir.display().to_string(),))?;
                    Some(prev)
                }
                None => None,
            };

            let outcome = run_cells(&run_cell, &env, notebook, options);

            if let Some(prev) = prev_dir {
                os.getattr("chdir")?.call1((prev,))?;
            }
            outcome
        })
    }
}

fn run_cells(
    run_cell: &Bound<'_, PyAny>,
    env: &Bound<'_, PyDict>,
    notebook: &mut Notebook,
    options: &ExecuteOptions,
) -> Result<()> {
    // A timeout too large to represent as an instant never elapses.
    let deadline = options.timeout.and_then(|timeout| {
        Instant::now()
            .checked_add(timeout)
            .map(|deadline| (deadline, timeout))
    });
    let mut execution_count = 0;

    for cell in notebook
        .cells
        .iter_mut()
        .filter(|cell| cell.cell_type == CellType::Code)
    {
        if let Some((deadline, timeout)) = deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
        }

        execution_count += 1;
        log::debug!("executing cell {execution_count}");
        let (stdout, stderr, result, error): CellReply =
            run_cell.call1((cell.source.as_str(), env.clone()))?.extract()?;

        let mut outputs = Vec::new();
        if !stdout.is_empty() {
            outputs.push(Output::Stream {
                name: "stdout".to_string(),
                text: stdout,
            });
        }
        if !stderr.is_empty() {
            outputs.push(Output::Stream {
                name: "stderr".to_string(),
                text: stderr,
            });
        }
        if let Some(repr) = result {
            outputs.push(Output::ExecuteResult {
                execution_count: Some(execution_count),
                data: BTreeMap::from([("text/plain".to_string(), Value::String(repr))]),
                metadata: Map::new(),
            });
        }
        if let Some((ename, evalue, traceback)) = &error {
            outputs.push(Output::Error {
                ename: ename.clone(),
                evalue: evalue.clone(),
                traceback: traceback.clone(),
            });
        }

        cell.execution_count = Some(execution_count);
        cell.outputs = Some(outputs);

        if let Some((ename, evalue, traceback)) = error {
            if !options.allow_errors {
                return Err(Error::Execution {
                    ename,
                    evalue,
                    traceback,
                });
            }
        }
    }

    Ok(())
}

/// Options for one orchestrated run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Strings to replace in code-cell inputs before the notebook runs.
    pub input_replacements: Option<Replacements>,

    /// Passthrough configuration for the execution engine.
    pub execute: ExecuteOptions,

    /// Working-directory hint for the engine. `run_from_path` derives this
    /// from the notebook's location when unset.
    pub workdir: Option<PathBuf>,
}

/// Execute a notebook in place: apply input-string substitution when
/// requested, then hand the document to the execution engine.
pub fn run_notebook(
    notebook: &mut Notebook,
    executor: &dyn NotebookExecutor,
    options: &RunOptions,
) -> Result<()> {
    if let Some(replacements) = &options.input_replacements {
        let mut preprocessor = ReplaceCodeInputStrings::new(replacements.clone());
        preprocessor.preprocess(notebook)?;
    }
    executor.execute(notebook, &options.execute, options.workdir.as_deref())
}

/// Load a notebook from `path` and execute it, running cell code from the
/// notebook's own directory unless `options.workdir` overrides it.
pub fn run_from_path(
    path: impl AsRef<Path>,
    executor: &dyn NotebookExecutor,
    options: &RunOptions,
) -> Result<Notebook> {
    let path = path.as_ref();
    let mut notebook = Notebook::from_path(path)?;

    let mut options = options.clone();
    if options.workdir.is_none() {
        options.workdir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf);
    }

    run_notebook(&mut notebook, executor, &options)?;
    Ok(notebook)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::cell::RefCell;

    #[test]
    fn test_returned_output_text() {
        let mut notebook = Notebook::from_code_cells(["2 + 2"]);
        run_notebook(&mut notebook, &PythonExecutor, &RunOptions::default()).unwrap();

        assert!(notebook.cells[0].output_text().contains('4'));
        assert_eq!(notebook.cells[0].execution_count, Some(1));
    }

    #[test]
    fn test_printed_output_text() {
        let mut notebook = Notebook::from_code_cells([
            "print(\"Some numbers:\")\nfor num in range(6):\n\tprint(num)",
        ]);
        run_notebook(&mut notebook, &PythonExecutor, &RunOptions::default()).unwrap();

        assert!(notebook.cells[0].output_text().contains('4'));
    }

    #[test]
    fn test_namespace_shared_between_cells() {
        let mut notebook = Notebook::from_code_cells(["value = 21", "value * 2"]);
        run_notebook(&mut notebook, &PythonExecutor, &RunOptions::default()).unwrap();

        assert!(notebook.cells[1].output_text().contains("42"));
        assert_eq!(notebook.cells[1].execution_count, Some(2));
    }

    #[test]
    fn test_cell_error_fails_run() {
        let mut notebook = Notebook::from_code_cells(["undefined_variable"]);
        let err =
            run_notebook(&mut notebook, &PythonExecutor, &RunOptions::default()).unwrap_err();

        assert_matches!(err, Error::Execution { ename, .. } if ename == "NameError");
    }

    #[test]
    fn test_allow_errors_captures_error_in_outputs() {
        let mut notebook = Notebook::from_code_cells(["undefined_variable", "after = True"]);
        let options = RunOptions {
            execute: ExecuteOptions {
                allow_errors: true,
                ..Default::default()
            },
            ..Default::default()
        };
        run_notebook(&mut notebook, &PythonExecutor, &options).unwrap();

        let outputs = notebook.cells[0].outputs.as_ref().unwrap();
        assert_matches!(
            &outputs[0],
            Output::Error { ename, .. } if ename == "NameError"
        );
        // Execution continued past the failing cell.
        assert_eq!(notebook.cells[1].execution_count, Some(2));
    }

    #[test]
    fn test_elapsed_deadline_fails_with_timeout() {
        let mut notebook = Notebook::from_code_cells(["1 + 1"]);
        let options = RunOptions {
            execute: ExecuteOptions {
                timeout: Some(Duration::ZERO),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = run_notebook(&mut notebook, &PythonExecutor, &options).unwrap_err();

        assert_matches!(err, Error::Timeout(_));
    }

    #[test]
    fn test_unrepresentable_timeout_runs_without_deadline() {
        let mut notebook = Notebook::from_code_cells(["2 + 2"]);
        let options = RunOptions {
            execute: ExecuteOptions {
                timeout: Some(Duration::MAX),
                ..Default::default()
            },
            ..Default::default()
        };
        run_notebook(&mut notebook, &PythonExecutor, &options).unwrap();

        assert!(notebook.cells[0].output_text().contains('4'));
    }

    /// Fake engine recording the code-cell sources it was handed.
    struct RecordingExecutor {
        seen: RefCell<Vec<String>>,
    }

    impl NotebookExecutor for RecordingExecutor {
        fn execute(
            &self,
            notebook: &mut Notebook,
            _options: &ExecuteOptions,
            _workdir: Option<&Path>,
        ) -> Result<()> {
            for cell in &notebook.cells {
                if cell.cell_type == CellType::Code {
                    self.seen.borrow_mut().push(cell.source.clone());
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_substitution_runs_before_engine() {
        let mut notebook = Notebook::from_code_cells(["dataset = \"YOUR-VALUE-HERE\""]);
        let executor = RecordingExecutor {
            seen: RefCell::new(Vec::new()),
        };
        let options = RunOptions {
            input_replacements: Some(Replacements::from([(
                "YOUR-VALUE-HERE".to_string(),
                "secret-var-for-execution".to_string(),
            )])),
            ..Default::default()
        };
        run_notebook(&mut notebook, &executor, &options).unwrap();

        assert_eq!(
            executor.seen.into_inner(),
            vec!["dataset = \"secret-var-for-execution\""]
        );
    }
}
