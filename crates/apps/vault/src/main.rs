//! Vault - mailbox backup and archive browser
//!
//! Operator CLI over the archive crate: triggers sync runs and prints
//! archive views as JSON.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use archive::{
    ArchiveError, ArchiveService, ArchiveSettings, AttachmentId, GmailClient, MailProvider,
    StaticToken, SyncRunId, SyncStatus, ThreadId, TokenFile, TokenProvider, parse_page,
};
use clap::{Parser, Subcommand};
use log::{debug, error, info};
use serde_json::json;

#[derive(Parser)]
#[command(name = "vault", version, about = "Back up a mailbox and browse the archive")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Archive directory (overrides settings.json and MAILVAULT_DATA_DIR)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a mailbox and wait for the run to finish
    Sync {
        owner: String,
        /// Provider search expression (empty = all mail)
        #[arg(short, long, default_value = "")]
        query: String,
        /// Access token; read from <config>/tokens/<owner>.token.json (owner URL-encoded) when absent
        #[arg(long, env = "MAILVAULT_ACCESS_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Resume a failed or cancelled run from its last checkpoint
    Resume {
        run_id: i64,
        #[arg(long, env = "MAILVAULT_ACCESS_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// List sync runs of a mailbox, newest first
    Runs { owner: String },
    /// List archived threads
    Browse {
        owner: String,
        #[arg(short, long, default_value = "")]
        label: String,
        #[arg(short, long, default_value = "")]
        search: String,
        /// Page number (0-based); invalid values mean the first page
        #[arg(short, long)]
        page: Option<String>,
    },
    /// Show a thread with its messages
    Thread { owner: String, thread_id: String },
    /// Save an attachment to a file
    Attachment {
        id: String,
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {:#}", e);
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            debug!("{:#}", e);
            let message = match e.downcast_ref::<ArchiveError>() {
                Some(archive_error) => archive_error.public_message(),
                None => "internal error",
            };
            eprintln!("error: {}", message);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut settings = ArchiveSettings::load();
    if let Some(dir) = cli.data_dir {
        settings.data_dir = dir;
    }
    let service = ArchiveService::open(settings).context("open archive")?;

    match cli.command {
        Commands::Sync {
            owner,
            query,
            token,
        } => {
            let supervisor = service.supervisor(provider(&service, token)?);
            supervisor.recover_interrupted()?;
            let run_id = supervisor.trigger(&owner, &query)?;
            info!("Waiting for run {} to finish", run_id);
            let run = supervisor.wait(run_id)?;
            print_json(&run)?;
            Ok(exit_code(run.status))
        }
        Commands::Resume { run_id, token } => {
            let supervisor = service.supervisor(provider(&service, token)?);
            supervisor.recover_interrupted()?;
            let run_id = supervisor.resume(SyncRunId(run_id))?;
            let run = supervisor.wait(run_id)?;
            print_json(&run)?;
            Ok(exit_code(run.status))
        }
        Commands::Runs { owner } => {
            print_json(&service.repository().list_sync_runs(&owner)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Browse {
            owner,
            label,
            search,
            page,
        } => {
            let page = parse_page(page.as_deref());
            print_json(&service.browse(&owner, &label, &search, page)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Thread { owner, thread_id } => {
            print_json(&service.thread(&owner, &ThreadId::new(thread_id))?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Attachment { id, out } => {
            let mut download = service.attachment(&AttachmentId::new(id))?;
            let file =
                File::create(&out).with_context(|| format!("create {}", out.display()))?;
            let mut writer = BufWriter::new(file);
            let written = io::copy(&mut download.stream, &mut writer)
                .with_context(|| format!("write {}", out.display()))?;
            print_json(&json!({
                "id": download.attachment.id,
                "filename": download.attachment.filename,
                "content_type": download.content_type,
                "size": download.attachment.size,
                "headers": download.attachment.headers,
                "storage_kind": download.attachment.storage_kind,
                "written": written,
                "path": out,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Gmail client authenticated with `token`, or with the owner's token file
fn provider(service: &ArchiveService, token: Option<String>) -> Result<Arc<dyn MailProvider>> {
    let tokens: Arc<dyn TokenProvider> = match token {
        Some(token) => Arc::new(StaticToken::new(token)),
        None => Arc::new(
            TokenFile::in_config_dir().ok_or_else(|| anyhow!("no config directory for tokens"))?,
        ),
    };
    let settings = service.settings();
    Ok(Arc::new(GmailClient::new(
        tokens,
        settings.provider_timeout(),
        settings.provider_page_size,
    )))
}

fn exit_code(status: SyncStatus) -> ExitCode {
    match status {
        SyncStatus::Succeeded => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
