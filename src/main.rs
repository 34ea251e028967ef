use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filechat::chat::ChatClient;
use filechat::config::Config;
use filechat::persistence;
use filechat::server::{self, AppState};
use filechat::session::{Role, SessionState};
use filechat::workflow::{self, Upload};
use log::{info, warn};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "filechat")]
#[command(about = "Batch file analysis assistant - send files with an instruction to a chat model and keep talking about each one")]
struct Cli {
    /// State file to use instead of the configured one
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one or more files with the current instruction
    Analyze {
        /// Files to process, one request each
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Replace the stored instruction before processing
        #[arg(short, long)]
        instruction: Option<String>,
    },
    /// Ask a follow-up question about an analyzed file
    Ask {
        filename: String,
        #[arg(required = true)]
        question: Vec<String>,
    },
    /// List analyzed files
    List,
    /// Print the conversation for one file
    Show {
        filename: String,
        /// Print the original file content as well
        #[arg(long)]
        content: bool,
    },
    /// Print or replace the stored instruction
    Instruction { text: Option<String> },
    /// Store the API key in the state file (plaintext)
    Credential { key: String },
    /// Delete every file and conversation
    Clear {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Serve the local web interface
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();
    let config = Config::load()?;
    let state_file = cli
        .state
        .clone()
        .unwrap_or_else(|| config.storage.state_file.clone());

    let mut session = load_session(&state_file);

    match cli.command {
        Commands::Analyze { paths, instruction } => {
            let client = ChatClient::new(config.chat.clone());
            analyze_files(&mut session, &client, &state_file, &paths, instruction)?;
        }
        Commands::Ask { filename, question } => {
            let client = ChatClient::new(config.chat.clone());
            ask_question(&mut session, &client, &state_file, &filename, &question.join(" "))?;
        }
        Commands::List => list_files(&session),
        Commands::Show { filename, content } => show_file(&session, &filename, content)?,
        Commands::Instruction { text } => match text {
            Some(text) => {
                session.set_instruction(text);
                persistence::flush(&state_file, &session.snapshot());
            }
            None => println!("{}", session.instruction()),
        },
        Commands::Credential { key } => {
            session.set_credential(key.trim());
            if persistence::flush(&state_file, &session.snapshot()) {
                info!("API key stored in {}", state_file.display());
            }
        }
        Commands::Clear { yes } => clear_all(&mut session, &state_file, yes)?,
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.server.port);
            let state = AppState::new(session, state_file, ChatClient::new(config.chat.clone()))
                .with_upload_limit(config.server.max_upload_bytes());
            tokio::runtime::Runtime::new()
                .context("Failed to start async runtime")?
                .block_on(server::run_server(state, port))?;
        }
    }

    Ok(())
}

fn load_session(state_file: &Path) -> SessionState {
    match persistence::restore(state_file) {
        Some(snapshot) => {
            info!("Loaded session state from {}", state_file.display());
            SessionState::from_snapshot(snapshot)
        }
        None => SessionState::default(),
    }
}

fn analyze_files(
    session: &mut SessionState,
    client: &ChatClient,
    state_file: &Path,
    paths: &[PathBuf],
    instruction: Option<String>,
) -> Result<()> {
    if let Some(instruction) = instruction {
        session.set_instruction(instruction);
    }

    let mut uploads = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        uploads.push(Upload::new(filename, bytes));
    }

    let result = workflow::analyze_uploads(session, client, &uploads, |i, total, name| {
        eprintln!("Processing ({}/{}): {} (asking {})...", i + 1, total, name, client.model());
    });
    persistence::flush(state_file, &session.snapshot());
    let report = result?;

    for filename in &report.analyzed {
        eprintln!("Initial analysis of {} complete", filename);
    }
    if !report.is_clean() {
        eprintln!("Some files failed:");
        for (filename, reason) in &report.failed {
            eprintln!("  - {}: {}", filename, reason);
        }
    }

    Ok(())
}

fn ask_question(
    session: &mut SessionState,
    client: &ChatClient,
    state_file: &Path,
    filename: &str,
    question: &str,
) -> Result<()> {
    let result = workflow::ask(session, client, filename, question);
    if session.record(filename).is_some() {
        persistence::flush(state_file, &session.snapshot());
    }

    let reply = result.context("Sorry, no reply this time")?;
    println!("{}", reply);
    Ok(())
}

fn list_files(session: &SessionState) {
    if session.is_empty() {
        eprintln!("No files processed yet.");
        return;
    }
    for (filename, record) in session.records() {
        println!("{}\t{} turns", filename, record.history.len());
    }
}

fn show_file(session: &SessionState, filename: &str, with_content: bool) -> Result<()> {
    let turns = workflow::display_history(session, filename)?;

    if with_content {
        if let Some(record) = session.record(filename) {
            println!("=== {} ===\n{}\n", filename, record.content);
        }
    }

    for turn in turns {
        let label = match turn.role {
            Role::User => "you",
            Role::Assistant => "model",
        };
        println!("[{}]\n{}\n", label, turn.content);
    }
    Ok(())
}

fn clear_all(session: &mut SessionState, state_file: &Path, yes: bool) -> Result<()> {
    session.request_clear();

    if !yes {
        if atty::isnt(atty::Stream::Stdin) {
            anyhow::bail!("Refusing to clear without confirmation; pass --yes");
        }
        eprint!("Delete all processed files and conversations? This cannot be undone. [y/N] ");
        io::stderr().flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            session.cancel_clear();
            eprintln!("Cancelled.");
            return Ok(());
        }
    }

    if session.confirm_clear() {
        if !persistence::flush(state_file, &session.snapshot()) {
            warn!("Cleared in memory only; the state file was not updated");
        }
        eprintln!("All history cleared.");
    }
    Ok(())
}
