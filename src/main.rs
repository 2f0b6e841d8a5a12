//! polychat - chat with OpenAI, OpenRouter, Claude and Gemini models from the
//! terminal.
//!
//! ## Usage
//!
//! ```bash
//! # Ask the default model, streaming the answer
//! polychat send "What is a borrow checker?"
//!
//! # Continue a conversation with another model
//! polychat send --conversation <ID> --model gemini/gemini-2.0-flash "And lifetimes?"
//!
//! # Attach files
//! polychat send --image cat.png "What breed?"
//! polychat send --document notes.pdf "Summarize"
//!
//! # History and keys
//! polychat list
//! polychat show <ID>
//! polychat keys set claude sk-ant-...
//! ```

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use polychat::commands::settings::{self, ChainedCredentials, CredentialSource, EnvCredentials};
use polychat::conversation::storage::{AttachmentStore, MemoryStorage};
use polychat::conversation::ConversationStore;
use polychat::db::models::{ConversationId, MessageStatus};
use polychat::db::Database;
use polychat::doc_processor;
use polychat::llm::ProviderKind;
use polychat::transport::{ReqwestTransport, Transport};
use polychat::{ChatService, Settings, Submission};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "polychat", version, about = "Multi-provider LLM chat")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true, env = "POLYCHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Keep history in memory only
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a message and print the reply
    Send {
        /// Model as provider/model, e.g. claude/claude-sonnet-4-20250514
        #[arg(long, short)]
        model: Option<String>,
        /// Conversation to continue
        #[arg(long, short)]
        conversation: Option<String>,
        #[arg(long)]
        image: Option<PathBuf>,
        /// .txt, .md or .pdf file
        #[arg(long)]
        document: Option<PathBuf>,
        /// Wait for the full reply instead of streaming it
        #[arg(long)]
        no_stream: bool,
        prompt: Vec<String>,
    },
    /// List conversations, newest first
    List,
    /// Print a conversation
    Show { id: String },
    /// Delete a conversation
    Delete { id: String },
    /// Models with a configured API key
    Models,
    /// Manage stored API keys
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    Show,
    Set { provider: String, value: String },
    Remove { provider: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("polychat=warn")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    if let Err(err) = run(Cli::parse()).await {
        eprintln!("Error: {err:?}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;

    let database = if cli.ephemeral {
        None
    } else {
        let dir = settings.data_dir();
        let db = Database::new(&dir)
            .with_context(|| format!("opening database in {}", dir.display()))?;
        Some(Arc::new(db))
    };

    if let Command::Keys { action } = &cli.command {
        let Some(db) = &database else {
            bail!("API keys are stored in the database; drop --ephemeral");
        };
        return manage_keys(db, action);
    }

    let store;
    let attachments: Arc<dyn AttachmentStore>;
    let credentials: Arc<dyn CredentialSource>;
    match &database {
        Some(db) => {
            store = ConversationStore::with_storage(db.clone());
            attachments = db.clone();
            credentials = Arc::new(ChainedCredentials::new(vec![
                Box::new(db.clone()),
                Box::new(EnvCredentials),
            ]));
        }
        None => {
            let memory = Arc::new(MemoryStorage::new());
            store = ConversationStore::with_storage(memory.clone());
            attachments = memory;
            credentials = Arc::new(EnvCredentials);
        }
    }
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new());
    let service = ChatService::new(settings, store, attachments, transport, credentials);

    match cli.command {
        Command::Send {
            model,
            conversation,
            image,
            document,
            no_stream,
            prompt,
        } => {
            let mut submission = Submission::new(prompt.join(" "));
            submission.conversation_id = conversation.map(ConversationId::from);
            submission.model = model;
            submission.image = image.as_deref().map(doc_processor::load_image).transpose()?;
            submission.document = document
                .as_deref()
                .map(doc_processor::parse_file)
                .transpose()?;
            submission.stream = !no_stream;
            send(&service, submission).await
        }
        Command::List => {
            for summary in service.list_conversations()? {
                println!(
                    "{}  {}  {:>3}  {}",
                    summary.id,
                    summary.created_at.format("%Y-%m-%d %H:%M"),
                    summary.message_count,
                    summary.title
                );
            }
            Ok(())
        }
        Command::Show { id } => {
            let id = ConversationId::from(id);
            let Some(conversation) = service.get_conversation(&id)? else {
                bail!("conversation {id} not found");
            };
            println!("# {}\n", conversation.title);
            for message in &conversation.messages {
                let model = message.model.as_deref().unwrap_or("-");
                println!("[{} | {}]", message.role.as_str(), model);
                println!("{}", message.content);
                match &message.status {
                    MessageStatus::Truncated => println!("(incomplete)"),
                    MessageStatus::Failed { error } => println!("(failed: {error})"),
                    _ => {}
                }
                println!();
            }
            Ok(())
        }
        Command::Delete { id } => {
            let id = ConversationId::from(id);
            if service.delete_conversation(&id)? {
                println!("Deleted {id}");
            } else {
                bail!("conversation {id} not found");
            }
            Ok(())
        }
        Command::Models => {
            let models = service.available_models();
            if models.is_empty() {
                eprintln!("No API keys configured. Use `polychat keys set` or set one of:");
                for kind in ProviderKind::ALL {
                    eprintln!("  {}", kind.api_key_env());
                }
            }
            for model in models {
                println!("{:<45} {} ({})", model.id, model.name, model.provider);
            }
            Ok(())
        }
        Command::Keys { .. } => Ok(()),
    }
}

async fn send(service: &ChatService, submission: Submission) -> Result<()> {
    let streaming = submission.stream;
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let mut stdout = io::stdout();
    let outcome = service
        .send_message(submission, cancel, |delta| {
            if streaming {
                let _ = write!(stdout, "{}", delta.text);
                let _ = stdout.flush();
            }
        })
        .await?;

    if !streaming {
        print!("{}", outcome.reply.content);
    }
    println!();

    match &outcome.reply.status {
        MessageStatus::Truncated => eprintln!("(response incomplete)"),
        MessageStatus::Failed { error } => eprintln!("Error: {error}"),
        _ => {}
    }
    eprintln!("conversation: {}", outcome.conversation_id);
    Ok(())
}

fn key_name(provider: &str) -> Result<String> {
    match ProviderKind::from_prefix(provider) {
        Some(kind) => Ok(settings::setting_key(kind)),
        None => bail!(
            "unknown provider {provider:?} (expected openai, openrouter, claude or gemini)"
        ),
    }
}

fn manage_keys(db: &Database, action: &KeyAction) -> Result<()> {
    match action {
        KeyAction::Show => {
            let mut stored: Vec<(String, String)> =
                settings::get_settings(db)?.into_iter().collect();
            stored.sort();
            for (key, masked) in stored {
                println!("{key} = {masked}");
            }
        }
        KeyAction::Set { provider, value } => {
            settings::set_setting(db, &key_name(provider)?, value)?;
            println!("Saved {provider} key");
        }
        KeyAction::Remove { provider } => {
            settings::delete_setting(db, &key_name(provider)?)?;
            println!("Removed {provider} key");
        }
    }
    Ok(())
}
