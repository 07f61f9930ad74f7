#![deny(dead_code)]
use anyhow::Result;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

mod utils;

use confab::config::{load_config, set_config_path_override};
use confab::transport::WebSocketConnector;
use confab::{ConversationStore, DeliveryStatus, HttpChatApi, Message, SessionManager, StoreEvent};

/// Command line arguments for confab
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "confab: a terminal client for STOMP chat contexts.",
    long_about = "confab connects one chat session, subscribes to a context and lets you \
    read and send direct messages from the terminal.\n\n\
    Commands: /open <contact>, /close, /unread, /history, /quit. \
    Any other line is sent to the open contact."
)]
struct Args {
    /// Your user id on the chat backend
    #[arg(long)]
    user: String,

    /// Chat context to join (defaults to the configured default context)
    #[arg(long)]
    context: Option<String>,

    /// Config file to use instead of the per-user one
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log file
    #[arg(long, value_name = "PATH", default_value = "confab.log")]
    log_file: PathBuf,

    /// Log at debug level
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, PartialEq)]
enum Input<'a> {
    Open(&'a str),
    Close,
    Unread,
    History,
    Quit,
    Text(&'a str),
    Unknown(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    let Some(command) = line.strip_prefix('/') else {
        return Input::Text(line);
    };
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map(|(n, a)| (n, a.trim()))
        .unwrap_or((command, ""));
    match name {
        "open" if !arg.is_empty() => Input::Open(arg),
        "close" => Input::Close,
        "unread" => Input::Unread,
        "history" => Input::History,
        "quit" | "exit" => Input::Quit,
        _ => Input::Unknown(line),
    }
}

fn format_message(message: &Message, me: &str) -> String {
    let who = if message.sender_id == me {
        "you"
    } else {
        message.sender_id.as_str()
    };
    let marker = match message.delivery_status {
        DeliveryStatus::SentLocal => " (sending)",
        DeliveryStatus::Failed => " (not sent)",
        DeliveryStatus::Confirmed | DeliveryStatus::Read => "",
    };
    format!("{}: {}{}", who, message.content, marker)
}

/// Line to print for a store event while `active` is open, if any.
fn live_line(event: &StoreEvent, active: Option<&str>, me: &str) -> Option<String> {
    match event {
        StoreEvent::MessageReceived {
            contact_id,
            message,
        } if active == Some(contact_id.as_str()) && message.sender_id != me => {
            Some(format_message(message, me))
        }
        _ => None,
    }
}

fn print_unread(store: &ConversationStore) {
    let total = store.unread_count();
    println!("{} unread", total);
    for contact in store.contacts() {
        let count = store.unread_count_for_contact(&contact);
        if count > 0 {
            println!("  {}: {}", contact, count);
        }
    }
}

async fn open_conversation(store: &ConversationStore, contact: &str) {
    if let Err(e) = store.load_messages(contact).await {
        println!("Could not load history with {}: {}", contact, e);
    }
    for message in store.messages_for_contact(contact) {
        println!("{}", format_message(&message, store.user_id()));
    }
    if let Err(e) = store.mark_messages_as_read(contact).await {
        warn!("Read receipt for {} failed: {}", contact, e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    utils::setup_logging(args.log_file.to_str(), level)?;

    if let Some(path) = &args.config {
        set_config_path_override(path.clone());
    }
    let config = load_config()?;
    let context = args
        .context
        .clone()
        .unwrap_or_else(|| config.default_context.clone());
    info!("Starting as user {} in context {}", args.user, context);

    let session = SessionManager::new(config.clone(), Arc::new(WebSocketConnector::new()));
    let api = Arc::new(HttpChatApi::new(&config.api_url)?);
    let store = ConversationStore::new(&args.user, &context, session.clone(), api);

    let refresh = store.clone();
    session.on_reconnected(move || {
        let store = refresh.clone();
        tokio::spawn(async move {
            let _ = store.load_unread_counts().await;
        });
    });

    store.start();
    println!("Connecting to {} ...", config.ws_url);
    match session.wait_connected(config.handshake_timeout() * 2).await {
        Ok(()) => println!("Connected."),
        Err(e) => {
            error!("Chat session not available: {}", e);
            println!("Not connected ({}). Messages will not be delivered.", e);
        }
    }
    if store.load_unread_counts().await.is_ok() {
        print_unread(&store);
    }

    let printer = store.clone();
    let mut events = store.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let active = printer.active_conversation();
                    if let Some(line) = live_line(&event, active.as_deref(), printer.user_id()) {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} store events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Input::Open(contact) => {
                println!("--- {} ---", contact);
                open_conversation(&store, contact).await;
            }
            Input::Close => store.set_active_conversation(None),
            Input::Unread => print_unread(&store),
            Input::History => match store.active_conversation() {
                Some(contact) => {
                    for message in store.messages_for_contact(&contact) {
                        println!("{}", format_message(&message, store.user_id()));
                    }
                }
                None => println!("No open conversation"),
            },
            Input::Quit => break,
            Input::Text(text) => match store.active_conversation() {
                Some(contact) => {
                    if let Some(echo) = store.send_message(&contact, text) {
                        println!("{}", format_message(&echo, store.user_id()));
                    }
                }
                None => {
                    if !text.is_empty() {
                        println!("Open a conversation first: /open <contact>");
                    }
                }
            },
            Input::Unknown(command) => println!("Unknown command: {}", command),
        }
    }

    store.stop();
    session.disconnect();
    info!("confab shutting down");
    Ok(())
}
