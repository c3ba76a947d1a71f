use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, APP_NAME};
use crate::models::{Conversation, NewEndpoint, ProviderKind, RagSettings};
use crate::services::attachments::read_file;
use crate::services::export::export_to_markdown;
use crate::services::images::ImageSize;
use crate::services::{ChatEvent, ChatSession, EventSink, Severity};

#[derive(Parser, Debug)]
#[command(name = "chatllm")]
#[command(about = "Chat with OpenAI-compatible language model endpoints")]
#[command(version)]
pub struct Cli {
    /// Path to the config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage API endpoints
    Endpoint {
        #[command(subcommand)]
        action: EndpointCommand,
    },
    /// Start a new conversation and select it
    New,
    /// List conversations, most recently updated first
    List,
    /// Print a conversation (the selected one by default)
    Show { id: Option<String> },
    /// Select a conversation
    Select { id: String },
    /// Send a message in the selected conversation
    Send {
        text: String,
        /// Attach a file (repeatable)
        #[arg(short, long = "file")]
        files: Vec<PathBuf>,
        /// Send in this conversation instead of the selected one
        #[arg(short, long)]
        conversation: Option<String>,
    },
    /// Replace a message's content
    Edit { message_id: String, content: String },
    /// Send a user message again
    Resend { message_id: String },
    /// Ask for a new assistant reply
    Regenerate { message_id: String },
    /// Delete a message
    DeleteMessage { message_id: String },
    /// List earlier versions of a message
    Versions { message_id: String },
    /// Restore an earlier version of a message
    Restore { message_id: String, version_id: String },
    /// Fork a conversation, optionally continuing from a user message with new content
    Fork {
        conversation_id: String,
        #[arg(long, requires = "content")]
        message: Option<String>,
        #[arg(long, requires = "message")]
        content: Option<String>,
    },
    /// Rename a conversation
    Rename { id: String, title: String },
    /// Delete a conversation
    Delete { id: String },
    /// Manage saved prompts
    Prompt {
        #[command(subcommand)]
        action: PromptCommand,
    },
    /// Show or change application settings
    Settings(SettingsArgs),
    /// Generate an image and print its URL
    Image {
        prompt: String,
        #[arg(long)]
        negative: Option<String>,
        #[arg(long, default_value = "dall-e-3")]
        model: String,
        #[arg(long, default_value = "1024x1024")]
        size: ImageSize,
    },
    /// Turn text into speech
    Speak {
        text: String,
        #[arg(long)]
        voice: Option<String>,
        #[arg(short, long, default_value = "speech.mp3")]
        output: PathBuf,
    },
    /// Export a conversation as markdown
    Export {
        id: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum EndpointCommand {
    /// Add an endpoint
    Add {
        name: String,
        #[arg(long, default_value = "https://api.openai.com/v1")]
        base_url: String,
        #[arg(long, default_value = "")]
        api_key: String,
        #[arg(long, default_value = "gpt-4o")]
        model: String,
        /// Answer with canned replies instead of calling an API
        #[arg(long)]
        offline: bool,
        /// Retrieval service used for attached documents
        #[arg(long)]
        rag_url: Option<String>,
        #[arg(long, requires = "rag_url")]
        rag_key: Option<String>,
        #[arg(long, default_value_t = 5)]
        top_k: u32,
    },
    List,
    /// Make an endpoint active
    Use { id: String },
    Remove { id: String },
    /// List the models the active endpoint offers
    Models {
        #[arg(long)]
        images: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum PromptCommand {
    Save { name: String, content: String },
    List,
    Delete { id: String },
}

#[derive(Args, Debug)]
pub struct SettingsArgs {
    #[arg(long)]
    pub stream: Option<bool>,
    #[arg(long)]
    pub temperature: Option<f32>,
    /// System prompt sent before every conversation; pass "" to clear
    #[arg(long)]
    pub system_prompt: Option<String>,
    #[arg(long)]
    pub tts_model: Option<String>,
    #[arg(long)]
    pub tts_voice: Option<String>,
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    let (events, rx) = EventSink::channel();
    let printer = spawn_printer(rx);

    let session = ChatSession::open(config, events)
        .await
        .with_context(|| format!("Failed to start {}", APP_NAME))?;
    let result = dispatch(&session, cli.command).await;

    // Dropping the session closes the event channel so the printer drains and exits
    drop(session);
    let _ = printer.await;
    result
}

fn spawn_printer(mut rx: mpsc::UnboundedReceiver<ChatEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ChatEvent::Notice {
                    severity,
                    title,
                    description,
                } => {
                    let label = match severity {
                        Severity::Info => "info",
                        Severity::Warning => "warning",
                        Severity::Error => "error",
                    };
                    eprintln!("[{}] {}: {}", label, title, description);
                }
                ChatEvent::Token { delta, .. } => {
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(delta.as_bytes());
                    let _ = stdout.flush();
                }
                ChatEvent::ReplyDiscarded { conversation_id } => {
                    tracing::debug!("Reply for {} discarded", conversation_id);
                }
                _ => {}
            }
        }
    })
}

async fn dispatch(session: &ChatSession, command: Command) -> Result<()> {
    match command {
        Command::Endpoint { action } => endpoint_command(session, action).await?,
        Command::New => {
            let conv = session.conversations.create().await?;
            println!("{}", conv.id);
        }
        Command::List => {
            let selected = session.conversations.selected_id();
            for conv in session.conversations.list() {
                let marker = if selected.as_deref() == Some(conv.id.as_str()) { "*" } else { " " };
                println!(
                    "{} {}  {}  ({} messages, updated {})",
                    marker,
                    conv.id,
                    conv.title,
                    conv.messages.len(),
                    conv.updated_at.format("%Y-%m-%d %H:%M")
                );
                if let Some(preview) = conv.last_message_preview() {
                    println!("    {}", preview);
                }
            }
        }
        Command::Show { id } => {
            let conv = resolve_conversation(session, id.as_deref())?;
            print_conversation(&conv);
        }
        Command::Select { id } => {
            let conv = resolve_conversation(session, Some(&id))?;
            session.conversations.select(&conv.id).await?;
        }
        Command::Send {
            text,
            files,
            conversation,
        } => {
            if let Some(id) = conversation {
                let conv = resolve_conversation(session, Some(&id))?;
                session.conversations.select(&conv.id).await?;
            }
            let mut pending = Vec::with_capacity(files.len());
            for path in &files {
                pending.push(read_file(path).await?);
            }
            let reply = session.pipeline.send_message(&text, pending).await?;
            print_reply(session, &reply.content).await;
        }
        Command::Edit {
            message_id,
            content,
        } => {
            if let Some(reply) = session.pipeline.edit_message(&message_id, &content).await? {
                print_reply(session, &reply.content).await;
            }
        }
        Command::Resend { message_id } => {
            let reply = session.pipeline.resend_message(&message_id).await?;
            print_reply(session, &reply.content).await;
        }
        Command::Regenerate { message_id } => {
            let reply = session.pipeline.regenerate(&message_id).await?;
            print_reply(session, &reply.content).await;
        }
        Command::DeleteMessage { message_id } => {
            session.pipeline.delete_message(&message_id).await?;
        }
        Command::Versions { message_id } => {
            let versions = session.pipeline.view_message_versions(&message_id).await?;
            if versions.is_empty() {
                println!("No earlier versions");
            }
            for version in versions {
                println!(
                    "{}  {}\n    {}",
                    version.id,
                    version.created_at.format("%Y-%m-%d %H:%M:%S"),
                    version.content.replace('\n', "\n    ")
                );
            }
        }
        Command::Restore {
            message_id,
            version_id,
        } => {
            let reply = session
                .pipeline
                .restore_message_version(&message_id, &version_id)
                .await?;
            if let Some(reply) = reply {
                print_reply(session, &reply.content).await;
            }
        }
        Command::Fork {
            conversation_id,
            message,
            content,
        } => {
            let source = resolve_conversation(session, Some(&conversation_id))?;
            let fork = match (message, content) {
                (Some(message_id), Some(content)) => {
                    session
                        .pipeline
                        .fork_from_version(&source.id, &message_id, &content)
                        .await?
                }
                _ => session.conversations.fork(&source.id).await?,
            };
            println!("{}", fork.id);
        }
        Command::Rename { id, title } => {
            let conv = resolve_conversation(session, Some(&id))?;
            session.conversations.rename(&conv.id, &title).await?;
        }
        Command::Delete { id } => {
            let conv = resolve_conversation(session, Some(&id))?;
            session.conversations.delete(&conv.id).await?;
        }
        Command::Prompt { action } => match action {
            PromptCommand::Save { name, content } => {
                let prompt = session.prompts.save(&name, &content).await?;
                println!("{}", prompt.id);
            }
            PromptCommand::List => {
                for prompt in session.prompts.list().await? {
                    println!("{}  {}\n    {}", prompt.id, prompt.name, prompt.content);
                }
            }
            PromptCommand::Delete { id } => session.prompts.delete(&id).await?,
        },
        Command::Settings(args) => settings_command(session, args).await?,
        Command::Image {
            prompt,
            negative,
            model,
            size,
        } => {
            let url = session
                .images
                .generate(&prompt, negative.as_deref(), &model, size)
                .await?;
            println!("{}", url);
        }
        Command::Speak {
            text,
            voice,
            output,
        } => {
            let audio = session.speech.synthesize(&text, voice.as_deref()).await?;
            tokio::fs::write(&output, &audio)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("{}", output.display());
        }
        Command::Export { id, output } => {
            let conv = resolve_conversation(session, id.as_deref())?;
            let markdown = export_to_markdown(&conv);
            match output {
                Some(path) => tokio::fs::write(&path, markdown)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => print!("{}", markdown),
            }
        }
    }
    Ok(())
}

async fn endpoint_command(session: &ChatSession, action: EndpointCommand) -> Result<()> {
    match action {
        EndpointCommand::Add {
            name,
            base_url,
            api_key,
            model,
            offline,
            rag_url,
            rag_key,
            top_k,
        } => {
            let rag = rag_url.map(|url| RagSettings {
                api_key: rag_key,
                top_k,
                ..RagSettings::new(url)
            });
            let endpoint = session
                .endpoints
                .add(NewEndpoint {
                    name,
                    kind: if offline { ProviderKind::Offline } else { ProviderKind::OpenAi },
                    base_url,
                    api_key,
                    model,
                    rag,
                })
                .await?;
            println!("{}", endpoint.id);
        }
        EndpointCommand::List => {
            for endpoint in session.endpoints.list() {
                let marker = if endpoint.is_active { "*" } else { " " };
                println!(
                    "{} {}  {}  {} [{}] {}{}",
                    marker,
                    endpoint.id,
                    endpoint.name,
                    endpoint.base_url,
                    endpoint.kind.display_name(),
                    endpoint.model,
                    if endpoint.active_rag().is_some() { " +rag" } else { "" }
                );
            }
        }
        EndpointCommand::Use { id } => {
            if session.endpoints.get(&id).is_none() {
                bail!("No endpoint with id {}", id);
            }
            session.endpoints.set_active(Some(&id)).await?;
        }
        EndpointCommand::Remove { id } => session.endpoints.remove(&id).await?,
        EndpointCommand::Models { images } => {
            let models = if images {
                session.endpoints.fetch_image_models().await?
            } else {
                session.endpoints.fetch_models().await
            };
            for model in models {
                println!("{}", model);
            }
        }
    }
    Ok(())
}

async fn settings_command(session: &ChatSession, args: SettingsArgs) -> Result<()> {
    let mut settings = session.settings().await;
    let mut changed = false;
    if let Some(stream) = args.stream {
        settings.stream_responses = stream;
        changed = true;
    }
    if let Some(temperature) = args.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            bail!("Temperature must be between 0 and 2");
        }
        settings.temperature = temperature;
        changed = true;
    }
    if let Some(prompt) = args.system_prompt {
        settings.default_system_prompt = Some(prompt).filter(|p| !p.trim().is_empty());
        changed = true;
    }
    if let Some(model) = args.tts_model {
        settings.tts_model = model;
        changed = true;
    }
    if let Some(voice) = args.tts_voice {
        settings.tts_voice = voice;
        changed = true;
    }
    if changed {
        session.save_settings(&settings).await?;
    }

    println!("stream_responses = {}", settings.stream_responses);
    println!("temperature = {}", settings.temperature);
    println!(
        "default_system_prompt = {}",
        settings.default_system_prompt.as_deref().unwrap_or("(none)")
    );
    println!("tts_model = {}", settings.tts_model);
    println!("tts_voice = {}", settings.tts_voice);
    Ok(())
}

/// Find a conversation by id or unique id prefix, defaulting to the selected one.
fn resolve_conversation(session: &ChatSession, id: Option<&str>) -> Result<Conversation> {
    let Some(id) = id else {
        return session
            .conversations
            .selected()
            .context("No conversation selected");
    };
    if let Some(conv) = session.conversations.get(id) {
        return Ok(conv);
    }
    let mut matches = session
        .conversations
        .list()
        .into_iter()
        .filter(|c| c.id.starts_with(id));
    match (matches.next(), matches.next()) {
        (Some(conv), None) => Ok(conv),
        (Some(_), Some(_)) => bail!("Conversation id {} is ambiguous", id),
        _ => bail!("No conversation with id {}", id),
    }
}

/// Streamed replies were already printed token by token.
async fn print_reply(session: &ChatSession, content: &str) {
    if session.settings().await.stream_responses {
        println!();
    } else {
        println!("{}", content);
    }
}

fn print_conversation(conv: &Conversation) {
    println!("# {}", conv.title);
    for message in &conv.messages {
        println!("\n[{}] {}:", message.id, message.role.label());
        println!("{}", message.content);
        for file in &message.files {
            println!("  (attachment: {}, {})", file.name, file.mime_type);
        }
    }
}
