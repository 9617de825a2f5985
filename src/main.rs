//! promptpool CLI - batch chat-completion client.
//!
//! Run `promptpool --help` for usage information.

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use promptpool::{Args, LlmClient, PoolError, Settings};
use std::path::Path;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    setup_logging(&args);

    // Load configuration
    let settings = match Settings::from_file(&args.config) {
        Ok(s) => s,
        Err(e) => {
            error!("Configuration error: {}", e);
            eprintln!("{} {}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    };
    if let Err(e) = settings.validate() {
        error!("Configuration error: {}", e);
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    // Connect and cache the model catalog
    let mut client = match LlmClient::connect(
        settings.endpoint.clone(),
        settings.key.clone(),
        settings.extra_headers(),
    )
    .await
    {
        Ok(c) => c,
        Err(e) => {
            error!("Connection error: {}", e);
            eprintln!("{} {}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    };

    for (i, model) in client.list_models().iter().enumerate() {
        println!("[{}] {}", i + 1, model);
    }

    client.set_model(&settings.model)?;
    client.set_prompt(&settings.prompt);
    client.set_max_tokens(settings.max_tokens);
    client.set_max_workers(settings.workers);
    if let Some(ratio) = settings.tokens_per_character {
        client.set_tokens_per_character(ratio);
    }

    // Collect inputs: one .txt file = one text
    let inputs = collect_inputs(&args.inputs).await?;
    if inputs.is_empty() {
        println!(
            "{} No .txt files found in {}",
            style("Warning:").yellow().bold(),
            args.inputs.display()
        );
        return Ok(());
    }

    let total = inputs.len();
    info!(inputs = total, model = %settings.model, "starting batch");
    client.add_texts(inputs);

    // Drive a progress bar from the client's progress callback
    let progress = if !args.no_progress && !args.json_logs {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)")
                .unwrap()
                .progress_chars("█▓▒░"),
        );

        let bar_writer = bar.clone();
        client.set_progress_callback(move |fraction| {
            bar_writer.set_position((fraction * total as f32).round() as u64);
        });

        Some(bar)
    } else {
        None
    };

    if let Err(e) = client.run().await {
        if let Some(bar) = &progress {
            bar.abandon();
        }
        error!("Run failed: {}", e);
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    if let Some(bar) = &progress {
        bar.finish();
    }

    for (i, result) in client.results().iter().enumerate() {
        println!("[{}] {}", i + 1, result);
    }

    Ok(())
}

/// Read every `*.txt` file in `dir` into one input text each.
///
/// Files are taken in path order; unreadable files are skipped with a
/// warning, matching the original batch tool.
async fn collect_inputs(dir: &Path) -> Result<Vec<String>> {
    let read_error = |e: std::io::Error| PoolError::InputFileRead {
        path: dir.to_path_buf(),
        source: e,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_error)?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "txt") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut inputs = Vec::with_capacity(paths.len());
    for path in paths {
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let content = content.strip_suffix('\n').unwrap_or(&content);
                inputs.push(content.to_string());
            }
            Err(e) => {
                println!("Could not read: {} ({})", path.display(), e);
            }
        }
    }

    Ok(inputs)
}

fn setup_logging(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("promptpool={level}")));

    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .compact(),
            )
            .init();
    }
}
