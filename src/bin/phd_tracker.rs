use anyhow::{Result, anyhow};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::sync::atomic::Ordering;

use phd_tracker::auth::oauth::GoogleTokenRefresher;
use phd_tracker::auth::token_store;
use phd_tracker::config::{load_config, resolve_db_path};
use phd_tracker::domain::application::{ApplicationStatus, ManualEdit, format_date};
use phd_tracker::mail::gmail_client::{GmailClient, ListQuery};
use phd_tracker::store::repo::{ApplicationRepository, UserRepository};
use phd_tracker::store::sqlite::SqliteRepo;
use phd_tracker::{SyncOptions, SyncOutcome, Synchronizer};

#[derive(Parser)]
#[command(name = "phd_tracker")]
#[command(about = "Track PhD application status from your mailbox", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync application records from the user's mailbox
    Sync {
        #[arg(long)]
        user: String,

        /// Print the sync report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage users whose mailbox can be synced
    User {
        #[command(subcommand)]
        cmd: UserCommand,
    },

    /// List application records
    List {
        #[arg(long)]
        user: String,

        /// Only applications with an interview today or later
        #[arg(long)]
        upcoming: bool,
    },

    /// Edit a record by hand; later syncs keep these values unless an
    /// email mentions the same field
    Edit {
        #[arg(long)]
        user: String,

        /// Mailbox message id the record was created from
        #[arg(long)]
        message: String,

        #[arg(long)]
        status: Option<ApplicationStatus>,

        #[arg(long)]
        interview_date: Option<NaiveDate>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Store the OAuth client secret in keyring
    SetClientSecret {
        #[arg(long)]
        client_id: String,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    /// Register a user; the mailbox refresh token is read from stdin
    Add {
        #[arg(long)]
        id: String,

        #[arg(long)]
        email: String,
    },
}

fn read_secret(prompt: &str) -> Result<String> {
    eprintln!("{prompt} (end with Ctrl-D):");
    let mut secret = String::new();
    std::io::Read::read_to_string(&mut std::io::stdin(), &mut secret)?;
    Ok(secret.trim().to_string())
}

fn open_repo() -> Result<SqliteRepo> {
    let cfg = load_config().map_err(|e| anyhow!("Configuration error: {e}"))?;
    let db_path = resolve_db_path(&cfg)?;
    SqliteRepo::open(&db_path)
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::SetClientSecret { client_id } => {
            let secret = read_secret("Paste client secret")?;
            token_store::save_client_secret(&client_id, &secret)?;
            println!("Saved client secret for client_id {}", client_id);
            Ok(())
        }

        Command::User {
            cmd: UserCommand::Add { id, email },
        } => {
            let repo = open_repo()?;
            let refresh_token = read_secret("Paste mailbox refresh token")?;
            let refresh_token = Some(refresh_token.as_str()).filter(|t| !t.is_empty());
            repo.upsert_user(&id, &email, refresh_token)?;
            println!("Saved user {id} <{email}>");
            Ok(())
        }

        Command::Sync { user, json } => {
            let cfg = load_config().map_err(|e| anyhow!("Configuration error: {e}"))?;
            let repo = SqliteRepo::open(&resolve_db_path(&cfg)?)?;

            let client_secret = token_store::resolve_client_secret(&cfg.client_id)?;
            let refresher = GoogleTokenRefresher::from_config(&cfg, client_secret);
            let gmail = GmailClient::new(&cfg.gmail.api_base)?;

            let sync = Synchronizer::new(
                &repo,
                &repo,
                &gmail,
                &refresher,
                SyncOptions {
                    query: ListQuery::from(&cfg.sync),
                    concurrency: cfg.sync.concurrency,
                },
            );

            let cancel = sync.cancel_flag();
            ctrlc::set_handler(move || {
                cancel.store(true, Ordering::SeqCst);
            })?;

            let report = sync.sync_for_user(&user)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Synced {} record(s) from {} message(s); {} skipped, {} failed",
                    report.synced_count, report.listed, report.skipped, report.failed
                );
            }

            if report.outcome() == SyncOutcome::TotalFailure {
                return Err(anyhow!("could not list any message for user {user}"));
            }
            Ok(())
        }

        Command::List { user, upcoming } => {
            let repo = open_repo()?;
            let today = Utc::now().date_naive();

            let mut records = repo.list_for_user(&user)?;
            if upcoming {
                records.retain(|r| r.has_upcoming_interview(today));
                records.sort_by_key(|r| r.interview_date);
            }

            for r in &records {
                println!(
                    "{:<18} {:<12} {:<14} {:<18} submitted {}{}",
                    r.source_message_id,
                    r.application_id.as_deref().unwrap_or("-"),
                    r.status,
                    r.interview_date
                        .map(format_date)
                        .unwrap_or_else(|| "no interview".to_string()),
                    format_date(r.submission_date.date_naive()),
                    if r.notes.is_empty() {
                        String::new()
                    } else {
                        format!("  ({})", r.notes)
                    }
                );
            }
            if records.is_empty() {
                println!("No applications.");
            }
            Ok(())
        }

        Command::Edit {
            user,
            message,
            status,
            interview_date,
            notes,
        } => {
            let repo = open_repo()?;
            let edit = ManualEdit {
                status,
                interview_date,
                notes,
            };
            match repo.apply_manual_edit(&user, &message, &edit)? {
                Some(r) => {
                    println!("Updated {} ({})", r.source_message_id, r.status);
                    Ok(())
                }
                None => Err(anyhow!("no application from message {message} for user {user}")),
            }
        }
    }
}
