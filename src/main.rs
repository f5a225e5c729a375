use std::sync::Arc;

use anyhow::Result;
use ondevice_chat::chat::{ChatSession, Role, TurnOutcome, TurnRejection};
use ondevice_chat::core::{
    app_state::AppContext,
    events::{AppEvent, ModelStatusPayload},
};
use ondevice_chat::models::ModelStatus;
use ondevice_chat::ChatError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::metadata::LevelFilter;

const HELP: &str = "\
Commands:
  /models            list catalog models
  /add <url>         add a model file hosted on huggingface.co
  /download <id>     download a model in the background
  /cancel <id>       cancel a running download
  /remove <id>       delete a model file (and custom entry)
  /load <id>         load a downloaded model
  /new               start a new chat
  /sessions          list chats
  /switch <id>       switch to another chat
  /delete <id>       delete a chat
  /quit              save and exit
Anything else is sent to the model.";

fn setup_logging() {
    let filter = std::env::var("CHAT_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::INFO);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let ctx = Arc::new(AppContext::from_environment()?);
    let active = ctx.initialize();
    tokio::spawn(report_events(ctx.clone()));

    println!("On-device chat. Type /help for commands.");
    print_session(&active);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, arg) = match line.split_once(char::is_whitespace) {
            Some((command, arg)) => (command, arg.trim()),
            None => (line, ""),
        };
        match command {
            "/quit" | "/exit" => break,
            "/help" => println!("{HELP}"),
            "/models" => list_models(&ctx),
            "/add" => match ctx.add_model(arg).await {
                Ok(descriptor) => println!(
                    "Added {} ({}) as {}",
                    descriptor.name, descriptor.size_label, descriptor.id
                ),
                Err(error) => report_error(&error),
            },
            "/download" => match ctx.download_model(arg) {
                Ok(true) => println!("Downloading {arg}..."),
                Ok(false) => println!("{arg} is already downloading"),
                Err(error) => report_error(&error),
            },
            "/cancel" => {
                if !ctx.cancel_download(arg) {
                    println!("No download running for {arg}");
                }
            }
            "/remove" => match ctx.remove_model(arg).await {
                Ok(outcome) => println!(
                    "Removed {arg} (file deleted: {}, entry deleted: {})",
                    outcome.file_removed, outcome.entry_removed
                ),
                Err(error) => report_error(&error),
            },
            "/load" => match ctx.load_model(arg).await {
                Ok(metadata) => println!(
                    "Loaded {arg}{}",
                    metadata
                        .description
                        .map(|description| format!(" ({description})"))
                        .unwrap_or_default()
                ),
                Err(error) => report_error(&error),
            },
            "/new" => print_session(&ctx.new_session()),
            "/sessions" => {
                for summary in ctx.sessions() {
                    let marker = if summary.active { '*' } else { ' ' };
                    println!(
                        "{marker} {}  {}  ({} messages)",
                        summary.id, summary.title, summary.message_count
                    );
                }
            }
            "/switch" => match ctx.switch_session(arg) {
                Some(session) => print_session(&session),
                None => println!("No chat with id {arg}"),
            },
            "/delete" => {
                if !ctx.delete_session(arg) {
                    println!("No chat with id {arg}");
                }
            }
            other if other.starts_with('/') => println!("Unknown command {other}; try /help"),
            _ => send(&ctx, line).await,
        }
    }

    ctx.on_background();
    Ok(())
}

async fn send(ctx: &AppContext, text: &str) {
    match ctx.send_message(text).await {
        Ok(TurnOutcome::Responded(session)) => {
            if let Some(reply) = session.messages.last() {
                println!("{}", reply.content);
                if let (Some(latency), Some(rate)) = (reply.latency_ms, reply.tokens_per_second) {
                    println!("  [{latency} ms, {rate:.1} tok/s]");
                }
            }
        }
        Ok(TurnOutcome::EmptyResponse(session)) | Ok(TurnOutcome::Failed { session, .. }) => {
            if let Some(reply) = session.messages.last() {
                println!("{}", reply.content);
            }
        }
        Ok(TurnOutcome::Rejected(TurnRejection::TurnInFlight)) => {
            println!("Still waiting for the previous reply");
        }
        Ok(TurnOutcome::Rejected(TurnRejection::EmptyInput)) => {}
        Err(error) => report_error(&error),
    }
}

fn report_error(error: &ChatError) {
    if error.is_user_facing() {
        println!("{error}");
    } else {
        tracing::error!("{error}");
        println!("Something went wrong; see the log for details");
    }
}

fn list_models(ctx: &AppContext) {
    for entry in ctx.list_models() {
        let descriptor = &entry.descriptor;
        let state = match ctx.model_status(&descriptor.id) {
            ModelStatus::Downloading { progress } => {
                format!("{:.0}%", progress * 100.0)
            }
            _ if entry.downloaded => "downloaded".to_string(),
            _ => String::new(),
        };
        println!(
            "{:<40} {:<10} {:<12} {}",
            descriptor.id, descriptor.size_label, state, descriptor.name
        );
    }
}

fn print_session(session: &ChatSession) {
    println!("== {} ({})", session.display_title(), session.id);
    for message in &session.messages {
        match message.role {
            Role::System => continue,
            Role::User => println!("> {}", message.content),
            Role::Assistant => println!("{}", message.content),
        }
    }
}

async fn report_events(ctx: Arc<AppContext>) {
    let mut events = ctx.subscribe();
    let mut last_percent = None;
    loop {
        match events.recv().await {
            Ok(AppEvent::ModelStatus(ModelStatusPayload { id, status })) => match status {
                ModelStatus::Downloading { progress } => {
                    let percent = (progress * 100.0).round() as u32;
                    if last_percent != Some(percent) {
                        last_percent = Some(percent);
                        eprintln!("{id}: {percent}%");
                    }
                }
                ModelStatus::Installed => eprintln!("{id}: installed"),
                ModelStatus::NotInstalled => eprintln!("{id}: not installed"),
                ModelStatus::Error(message) => eprintln!("{id}: {message}"),
            },
            Ok(AppEvent::Warning(message)) => eprintln!("warning: {message}"),
            Ok(AppEvent::SessionsChanged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
