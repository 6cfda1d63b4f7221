//! Stream one Codex turn to the terminal.
//!
//! Usage:
//!   cargo run --example stream -- "Summarise the README"
//!   cargo run --example stream -- --model gpt-5-codex --cd ../project "Fix the failing test"
//!   cargo run --example stream -- --image diagram.png "What does this show?"
//!   cargo run --example stream -- --resume <thread-id> "Now add docs"
//!
//! Ctrl-C cancels the turn and kills the agent process.

use std::path::PathBuf;

use clap::Parser;
use codex_stream::{
    CancellationToken, Codex, CodexOptions, Input, InputSegment, ItemStage, SandboxMode,
    StreamCallbacks, ThreadEvent, ThreadOptions, TurnOptions,
};

#[derive(Parser)]
#[command(name = "stream", about = "Stream a Codex turn")]
struct Cli {
    /// Prompt to send
    prompt: String,

    /// Model to use
    #[arg(long)]
    model: Option<String>,

    /// Working directory for the agent
    #[arg(long = "cd")]
    working_directory: Option<PathBuf>,

    /// Allow the agent to write inside the working directory
    #[arg(long)]
    write: bool,

    /// Attach an image (repeatable)
    #[arg(long)]
    image: Vec<PathBuf>,

    /// Resume an existing thread
    #[arg(long)]
    resume: Option<String>,

    /// Path to the codex binary
    #[arg(long)]
    codex: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut options = CodexOptions::default();
    if let Some(path) = cli.codex.clone() {
        options = options.with_codex_path(path);
    }
    let codex = match Codex::new(options) {
        Ok(codex) => codex,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let mut thread_options = ThreadOptions::default().skip_git_repo_check();
    if let Some(model) = cli.model.clone() {
        thread_options = thread_options.with_model(model);
    }
    if let Some(dir) = cli.working_directory.clone() {
        thread_options = thread_options.with_working_directory(dir);
    }
    if cli.write {
        thread_options = thread_options.with_sandbox(SandboxMode::WorkspaceWrite);
    }

    let thread = match cli.resume.clone() {
        Some(id) => codex.resume_thread(id, thread_options),
        None => codex.start_thread(thread_options),
    };

    let input: Input = if cli.image.is_empty() {
        cli.prompt.clone().into()
    } else {
        let mut segments = vec![InputSegment::text(cli.prompt.clone())];
        segments.extend(cli.image.iter().cloned().map(InputSegment::local_image));
        segments.into()
    };

    // Per-file progress goes through callbacks; the loop below prints the rest.
    let callbacks = StreamCallbacks::new()
        .on_command(|stage, cmd| {
            if stage == ItemStage::Started {
                println!("$ {}", cmd.command);
            }
        })
        .on_file_change(|stage, _, change| {
            if stage == ItemStage::Completed {
                println!("  {:?} {}", change.kind, change.path);
            }
        });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let turn = TurnOptions::default()
        .with_callbacks(callbacks)
        .with_cancel(cancel);
    let mut stream = match thread.run_streamed(input, turn) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    while let Some(event) = stream.recv().await {
        match event {
            ThreadEvent::ThreadStarted(e) => eprintln!("[thread {}]", e.thread_id),
            ThreadEvent::ItemCompleted(e) => {
                if let codex_stream::ThreadItem::AgentMessage(msg) = e.item {
                    println!("\n{}\n", msg.text);
                }
            }
            ThreadEvent::TurnCompleted(e) => eprintln!(
                "[tokens: {} in ({} cached), {} out]",
                e.usage.input_tokens, e.usage.cached_input_tokens, e.usage.output_tokens
            ),
            _ => {}
        }
    }

    match stream.wait().await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => eprintln!("[cancelled]"),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
