/// Example: executing a notebook and exporting it to Markdown
///
/// This example demonstrates:
/// - Building a notebook from code fragments
/// - Substituting placeholder strings before execution
/// - Reading captured cell output
/// - Removing test-only cells before export
/// - Exporting the result to Markdown

use anyhow::Result;
use nbsampleutils::*;

fn main() -> Result<()> {
    println!("=== nbsampleutils: Export Sample Example ===\n");

    // Step 1: Build a notebook from code fragments
    println!("Step 1: Building notebook...");
    let mut notebook = Notebook::from_code_cells([
        "dataset_id = \"YOUR-VALUE-HERE\"\nprint(f\"using dataset {dataset_id}\")",
        "total = sum(range(10))\ntotal",
        "# TEST_CELL\nassert total == 45",
    ]);
    println!("  ✓ Created {} code cells", notebook.cells.len());

    // Step 2: Execute with an input substitution
    println!("\nStep 2: Executing with substitution...");
    let options = RunOptions {
        input_replacements: Some(Replacements::from([(
            "YOUR-VALUE-HERE".to_string(),
            "sample-dataset-0001".to_string(),
        )])),
        ..Default::default()
    };
    run_notebook(&mut notebook, &PythonExecutor, &options)?;
    println!("  ✓ Executed {} cells", notebook.cells.len());
    println!("  Cell 2 output: {}", notebook.cells[1].output_text().trim());

    // Step 3: Drop the verification cell before publishing
    println!("\nStep 3: Removing tagged cells...");
    let mut cleanup = RemoveTaggedCells::new("# TEST_CELL");
    cleanup.preprocess(&mut notebook)?;
    println!("  ✓ {} cells remain", notebook.cells.len());

    // Step 4: Export to Markdown, restoring the placeholder in the output
    println!("\nStep 4: Exporting to Markdown...");
    let output_dir = std::env::temp_dir().join("nbsampleutils-export-sample");
    let redactions = Replacements::from([(
        "sample-dataset-0001".to_string(),
        "YOUR-VALUE-HERE".to_string(),
    )]);
    let md_path = export_notebook(
        &notebook,
        &MarkdownExporter,
        "export-sample",
        &output_dir,
        Some(&redactions),
    )?;
    println!("  ✓ Wrote {}", md_path.display());

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
