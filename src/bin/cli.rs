#![cfg(not(tarpaulin_include))]

use clap::Parser;
use flashdash::executor::{ExecutorConfig, Outcome, Shown, execute};
use flashdash::graph;
use flashdash::loader::load_path;
use flashdash::table::Registry;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

/// Run a snippet against local files, without the server.
#[derive(Parser, Debug)]
#[command(name = "flashdash-cli")]
struct Args {
    /// Snippet file (Rhai script)
    snippet: PathBuf,

    /// Tabular files to load, in order
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Write the figure bound to `fig` here as standalone HTML
    #[arg(long)]
    figure: Option<PathBuf>,

    /// Operation ceiling for the run (0 = unlimited)
    #[arg(long, default_value = "50000000")]
    max_operations: u64,
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let start_time = Instant::now();

    let mut registry = Registry::new();
    for path in &args.files {
        match load_path(path) {
            Ok((name, table)) => {
                println!("loaded {} ({} rows x {} columns)", name, table.height(), table.width());
                if !registry.insert(name.clone(), table) {
                    eprintln!("skipping {}: a file with that name is already loaded", name);
                }
            }
            Err(e) => eprintln!("{}", e),
        }
    }
    if registry.is_empty() {
        eprintln!("Error: no file could be loaded");
        return Ok(ExitCode::FAILURE);
    }

    let source = std::fs::read_to_string(&args.snippet)?;
    let config = ExecutorConfig {
        max_operations: args.max_operations,
    };
    let report = execute(&source, &registry, &config);

    println!("{}", report.hint);
    for line in &report.output {
        println!("{}", line);
    }
    for shown in &report.shown {
        match shown {
            Shown::Text { text } => println!("{}", text),
            Shown::Table {
                columns,
                rows,
                total_rows,
            } => {
                println!("{}", columns.join("\t"));
                for row in rows {
                    let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                    println!("{}", cells.join("\t"));
                }
                if *total_rows > rows.len() {
                    println!("... {} rows in total", total_rows);
                }
            }
            Shown::Figure { figure } => println!(
                "[figure] {} ({} series, {} points)",
                figure.options.title,
                figure.series.len(),
                figure.point_count()
            ),
        }
    }

    if let (Some(path), Some(figure)) = (&args.figure, &report.figure) {
        std::fs::write(path, graph::to_html(figure)?)?;
        println!("figure written to {}", path.display());
    }

    let elapsed = start_time.elapsed().as_secs_f64();
    let status = match &report.outcome {
        Outcome::Completed => "ok".to_string(),
        Outcome::Failed { message, line } => match line {
            Some(line) => format!("failed at line {}: {}", line, message),
            None => format!("failed: {}", message),
        },
        Outcome::Denied { module } => {
            format!("Import of '{}' is blocked in this sandbox.", module)
        }
    };
    println!("[{:.1}] ({})", elapsed, status);

    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
