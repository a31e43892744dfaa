use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;

use mail_triage::auth::oauth::{OAuthSettings, perform_pkce_flow};
use mail_triage::auth::token_manager::{TokenManager, now_epoch};
use mail_triage::auth::token_store;
use mail_triage::config::{Config, load_config, resolve_db_path};
use mail_triage::daemon::{DaemonConfig, run_daemon};
use mail_triage::domain::email::{EmailRecord, Priority};
use mail_triage::llm::adapter::Adapter;
use mail_triage::llm::ollama::OllamaClient;
use mail_triage::mail::graph::GraphClient;
use mail_triage::pipeline::Pipeline;
use mail_triage::rules::RuleSet;
use mail_triage::store::{EmailRepository, SqliteRepo};
use mail_triage::worker::WorkerPool;

#[derive(Parser)]
#[command(name = "mail_triage")]
#[command(about = "Mailbox triage: relevance filter, summaries and reply drafts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in through the browser and store the tokens
    Login,

    /// Forget stored tokens
    Logout,

    /// Fetch and process recent messages
    Sync {
        #[arg(long)]
        limit: Option<usize>,

        /// Look back this many days
        #[arg(long)]
        days: Option<i64>,
    },

    /// Poll for new messages until ctrl-c
    Daemon {
        /// Seconds between polls
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Most recent processed emails
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// One email with its summary, draft and full body
    Show { id: String },

    /// Emails still waiting for a reply
    Unreplied,

    /// Emails of one priority (low, medium, high)
    Priority { level: String },

    Search {
        query: String,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Send a reply; without --text the stored draft is sent
    Reply {
        id: String,

        #[arg(long)]
        text: Option<String>,
    },

    /// Draft a fresh reply
    Regenerate { id: String },

    /// Rewrite the stored draft with extra guidance
    Enhance { id: String, context: String },

    /// Credential, model and sync status
    Status,

    /// Store the OAuth client secret in keyring
    SetClientSecret {
        #[arg(long)]
        client_id: String,
    },
}

struct App {
    tokens: Arc<TokenManager>,
    pipeline: Arc<Pipeline>,
}

fn config() -> Result<Config> {
    load_config().map_err(|e| anyhow!("Configuration error: {e}"))
}

fn open_store(cfg: &Config) -> Result<SqliteRepo> {
    let db_path = resolve_db_path(cfg)?;
    Ok(SqliteRepo::open(&db_path)?)
}

fn build(cfg: &Config) -> Result<App> {
    let store = Arc::new(open_store(cfg)?);
    let tokens = Arc::new(TokenManager::from_config(cfg)?);

    let model = OllamaClient::from_config(&cfg.model)?;
    let assistant = Adapter::new(model)
        .with_temperature(cfg.model.temperature)
        .with_owner_name(cfg.owner_name.clone());
    let rules = RuleSet::load(cfg.rules_path.as_deref().map(Path::new))?;

    let pipeline = Pipeline::new(
        Arc::new(GraphClient::new()?),
        Arc::new(assistant),
        store,
        tokens.clone(),
    )
    .with_rules(rules)
    .with_sync_config(cfg.sync.clone());

    Ok(App {
        tokens,
        pipeline: Arc::new(pipeline),
    })
}

fn print_records(records: &[EmailRecord]) {
    if records.is_empty() {
        println!("No emails.");
        return;
    }
    for r in records {
        let mark = if r.has_reply { "replied" } else { "open" };
        println!(
            "[{:<6}] {:<7} {}  {} | {}",
            r.priority, mark, r.timestamp, r.sender, r.subject
        );
        println!("         id: {}", r.id);
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::SetClientSecret { client_id } => {
            eprintln!("Paste client secret (end with Ctrl-D):");
            let mut secret = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut secret)?;
            let secret = secret.trim();
            token_store::save_client_secret(&client_id, secret)?;
            println!("Saved client secret for client_id {}", client_id);
            Ok(())
        }

        Command::Login => {
            let cfg = config()?;
            let secret = token_store::load_client_secret(&cfg.client_id)?;
            let settings = OAuthSettings::from_config(&cfg, secret);
            let tokens = perform_pkce_flow(&settings)?;
            let mgr = TokenManager::from_config(&cfg)?;
            mgr.install(tokens, now_epoch())?;
            println!("Signed in.");
            Ok(())
        }

        Command::Logout => {
            let cfg = config()?;
            TokenManager::from_config(&cfg)?.logout()?;
            println!("Signed out.");
            Ok(())
        }

        Command::Sync { limit, days } => {
            let mut cfg = config()?;
            if let Some(limit) = limit {
                cfg.sync.limit = limit;
            }
            if let Some(days) = days {
                cfg.sync.lookback_days = days;
            }
            let app = build(&cfg)?;
            let report = app.pipeline.sync_recent()?;
            println!(
                "Processed {} of {} fetched: {} new, {} already stored, {} filtered, {} failed.",
                report.processed(),
                report.fetched,
                report.persisted,
                report.existing,
                report.discarded,
                report.failed
            );
            print_records(&report.records);
            Ok(())
        }

        Command::Daemon { interval } => {
            let mut cfg = config()?;
            if let Some(secs) = interval {
                cfg.sync.poll_interval_secs = secs;
            }
            let app = build(&cfg)?;
            run_daemon(app.pipeline, DaemonConfig::from(&cfg.sync))
        }

        Command::List { limit, json } => {
            let store = open_store(&config()?)?;
            let records = store.list_recent(limit)?;
            if json {
                print_json(&records)
            } else {
                print_records(&records);
                Ok(())
            }
        }

        Command::Show { id } => {
            let app = build(&config()?)?;
            let detail = app.pipeline.message_detail(&id)?;
            let r = &detail.record;
            println!("From:     {} <{}>", r.sender_name, r.sender);
            println!("Subject:  {}", r.subject);
            println!("Received: {}", r.timestamp);
            println!("Priority: {}", r.priority);
            println!("Replied:  {}", if r.has_reply { "yes" } else { "no" });
            println!("\nSummary:\n{}", r.summary);
            println!("\n{}", detail.full_body.as_deref().unwrap_or(&r.body));
            if !r.draft_reply.is_empty() {
                println!("\nDraft reply:\n{}", r.draft_reply);
            }
            Ok(())
        }

        Command::Unreplied => {
            let store = open_store(&config()?)?;
            print_records(&store.list_unreplied()?);
            Ok(())
        }

        Command::Priority { level } => {
            let store = open_store(&config()?)?;
            print_records(&store.list_by_priority(Priority::parse(&level))?);
            Ok(())
        }

        Command::Search { query, limit } => {
            let store = open_store(&config()?)?;
            print_records(&store.search(&query, limit)?);
            Ok(())
        }

        Command::Stats { json } => {
            let store = open_store(&config()?)?;
            let stats = store.stats()?;
            if json {
                return print_json(&stats);
            }
            println!("Total:      {}", stats.total);
            println!("Unreplied:  {}", stats.unreplied);
            println!("Replied:    {}", stats.replied);
            println!("Last 24h:   {}", stats.last_24h);
            println!("Reply rate: {:.1}%", stats.reply_rate);
            println!(
                "Priority:   high {} / medium {} / low {}",
                stats.by_priority.high, stats.by_priority.medium, stats.by_priority.low
            );
            for s in &stats.top_senders {
                println!("  {:>4}  {}", s.count, s.sender);
            }
            Ok(())
        }

        Command::Reply { id, text } => {
            let app = build(&config()?)?;
            let text = match text {
                Some(t) => t,
                None => {
                    app.pipeline
                        .store()
                        .get_by_id(&id)?
                        .ok_or_else(|| anyhow!("no email with id {id}"))?
                        .draft_reply
                }
            };
            if app.pipeline.send_reply(&id, &text)? {
                println!("Reply sent.");
            } else {
                println!("The provider did not accept the reply.");
            }
            Ok(())
        }

        Command::Regenerate { id } => {
            let app = build(&config()?)?;
            println!("{}", app.pipeline.regenerate_draft(&id)?);
            Ok(())
        }

        Command::Enhance { id, context } => {
            let app = build(&config()?)?;
            println!("{}", app.pipeline.enhance_draft(&id, &context)?);
            Ok(())
        }

        Command::Status => {
            let cfg = config()?;
            let app = build(&cfg)?;
            let pool = WorkerPool::new(cfg.sync.workers);

            let assistant = app.pipeline.assistant().clone();
            let model = pool.submit(move || assistant.check_health())?;
            let tokens = app.tokens.clone();
            let credential = pool.submit(move || tokens.state(now_epoch()))?;
            let store = app.pipeline.store().clone();
            let last_sync = pool.submit(move || store.last_sync_time())?;

            println!("Credential: {:?}", credential.wait()?);
            println!(
                "Model:      {} ({})",
                cfg.model.name,
                if model.wait()? { "available" } else { "unavailable" }
            );
            match last_sync.wait()?? {
                Some(t) => println!("Last sync:  {t}"),
                None => println!("Last sync:  never"),
            }
            pool.wait();
            Ok(())
        }
    }
}
