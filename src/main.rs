//! CLI entry point for the overlay messenger.
//!
//! `run` starts a node and a line-oriented console on stdin; `config`
//! manages the TOML configuration file.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use overlay_messenger::{
    utils::{NetworkMode, DEFAULT_CONFIG_FILE},
    App, AppEvent, MessengerConfig,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc::UnboundedReceiver;

/// Audio sample rate offered when starting calls
const CALL_SAMPLE_RATE: u32 = 48_000;

/// Overlay Messenger - serverless chat over UDP
#[derive(Parser)]
#[command(name = "messenger")]
#[command(about = "A peer-to-peer UDP messenger with LAN discovery, DHT rendezvous and hole punching")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node with an interactive console
    Run {
        /// Username announced to peers
        #[arg(short, long)]
        username: String,
        /// Discovery mode (local, internet)
        #[arg(short, long)]
        mode: Option<NetworkMode>,
        /// First port of the local port range
        #[arg(short, long)]
        port: Option<u16>,
        /// DHT bootstrap multiaddrs
        #[arg(short, long)]
        bootstrap: Vec<String>,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let config = MessengerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            username,
            mode,
            port,
            bootstrap,
        } => handle_run_command(username, mode, port, bootstrap, config).await,
        Commands::Config { action } => handle_config_commands(action, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

async fn handle_run_command(
    username: String,
    mode: Option<NetworkMode>,
    port: Option<u16>,
    bootstrap: Vec<String>,
    mut config: MessengerConfig,
) -> Result<()> {
    config.identity.username = username;
    if let Some(mode) = mode {
        config.network.mode = mode;
    }
    if let Some(port) = port {
        config.network.base_port = port;
    }
    if !bootstrap.is_empty() {
        config.rendezvous.bootstrap_nodes = bootstrap;
    }

    info!("Starting overlay messenger as {}...", config.identity.username);
    let (app, events) = App::start(config).await?;
    println!(
        "{} online at {} (public {:?}). Type /help for commands.",
        app.username(),
        app.local_addr(),
        app.public_addr()
    );

    tokio::spawn(print_events(events));

    tokio::select! {
        result = console(app.clone()) => {
            if let Err(e) = result {
                error!("Console error: {}", e);
            }
        }
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Signal handler failed: {}", e);
            }
            info!("Shutdown signal received");
        }
    }

    app.shutdown().await;
    Ok(())
}

async fn print_events(mut events: UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::MessageReceived { from, message } => println!("[{from}] {}", text_of(&message)),
            AppEvent::GroupMessageReceived {
                group_id,
                sender,
                message,
            } => println!("[{group_id}/{sender}] {}", text_of(&message)),
            AppEvent::IncomingContactRequest { from } => {
                println!("* {from} wants to add you. /accept {from} or /reject {from}");
            }
            AppEvent::GroupInvite {
                from,
                group_id,
                group_name,
            } => println!("* {from} invited you to '{group_name}'. /group accept {group_id}"),
            AppEvent::IncomingP2pCall { from, sample_rate } => {
                println!("* {from} is calling ({sample_rate} Hz). /answer yes|no");
            }
            AppEvent::IncomingGroupCall { group_id, from, .. } => {
                println!("* {from} started a call in {group_id}. /gcall answer {group_id}");
            }
            AppEvent::SecureChannelEstablished { username } => println!("* secure channel with {username}"),
            AppEvent::PeerLost { username } => println!("* {username} went offline"),
            other => println!("* {other:?}"),
        }
    }
}

fn text_of(message: &Value) -> String {
    message
        .get("text")
        .and_then(Value::as_str)
        .map_or_else(|| message.to_string(), str::to_string)
}

fn chat_message(text: &str) -> Value {
    json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "text": text,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

async fn console(app: App) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = run_console_command(&app, line).await {
            println!("! {e}");
        }
    }
    Ok(())
}

async fn run_console_command(app: &App, line: &str) -> Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let (arg, text) = rest.split_once(' ').unwrap_or((rest, ""));

    match command {
        "/help" => print_help(),
        "/find" => app.find_peer(arg).await?,
        "/msg" => {
            let message = chat_message(text);
            app.send_private_message(arg, message.clone()).await?;
            app.append_history(arg, message).await;
        }
        "/all" => {
            let message = chat_message(rest);
            let sent = app.broadcast_message(message.clone()).await;
            app.append_history("global", message).await;
            println!("sent to {sent} peer(s)");
        }
        "/connect" => app.connect_to(arg).await?,
        "/contact" => app.send_contact_request(arg).await?,
        "/accept" => app.respond_contact_request(arg, true).await?,
        "/reject" => app.respond_contact_request(arg, false).await?,
        "/group" => run_group_command(app, arg, text).await?,
        "/call" => app.start_call(arg, CALL_SAMPLE_RATE).await?,
        "/answer" => app.answer_call(arg != "no").await?,
        "/hangup" => app.hang_up().await?,
        "/gcall" => match arg {
            "start" => app.start_group_call(text, CALL_SAMPLE_RATE).await?,
            "answer" => app.answer_group_call(text, true).await?,
            "decline" => app.answer_group_call(text, false).await?,
            "leave" => app.leave_group_call().await?,
            _ => println!("usage: /gcall start|answer|decline <group> | /gcall leave"),
        },
        "/peers" => {
            for peer in app.peers().await {
                let secure = if app.is_secure(&peer.username).await { "secure" } else { "" };
                println!("{:<16} {:<22} {}", peer.username, peer.target(), secure);
            }
        }
        "/stats" => println!("{:#?}", app.stats().await),
        other => println!("unknown command {other}, try /help"),
    }
    Ok(())
}

async fn run_group_command(app: &App, action: &str, args: &str) -> Result<()> {
    let (first, second) = args.split_once(' ').unwrap_or((args, ""));
    match action {
        "create" => {
            let group_id = app.create_group(args).await;
            println!("created {group_id}");
        }
        "invite" => app.invite_to_group(first, second).await?,
        "accept" => app.respond_group_invite(first, true).await?,
        "decline" => app.respond_group_invite(first, false).await?,
        "join" => app.join_group(first).await?,
        "say" => app.send_group_message(first, chat_message(second)).await?,
        "kick" => app.kick_from_group(first, second).await?,
        "leave" => app.leave_group(first).await?,
        "list" => {
            for group in app.groups().await {
                let members: Vec<_> = group.members.iter().map(String::as_str).collect();
                println!("{} '{}' admin={} [{}]", group.group_id, group.name, group.admin, members.join(", "));
            }
            for (group_id, admin, name) in app.pending_invites().await {
                println!("{group_id} '{name}' invited by {admin}");
            }
        }
        _ => println!("usage: /group create|invite|accept|decline|join|say|kick|leave|list"),
    }
    Ok(())
}

fn print_help() {
    println!("/find <user>                 look a user up in the DHT");
    println!("/connect <user>              start the key exchange");
    println!("/msg <user> <text>           private message");
    println!("/all <text>                  message every connected peer");
    println!("/contact <user>              send a contact request");
    println!("/accept|/reject <user>       answer a contact request");
    println!("/group <action> ...          create, invite, accept, join, say, kick, leave, list");
    println!("/call <user>, /answer yes|no, /hangup");
    println!("/gcall start|answer|decline <group>, /gcall leave");
    println!("/peers, /stats, /quit");
}

fn handle_config_commands(action: ConfigCommands, config: &MessengerConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            MessengerConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let mut config_to_validate = match file {
                Some(path) => MessengerConfig::from_file(path)?,
                None => config.clone(),
            };
            // The username normally comes from `run --username`
            if config_to_validate.identity.username.is_empty() {
                warn!("identity.username is empty; pass --username to run");
                config_to_validate.identity.username = "unnamed".to_string();
            }
            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => println!("{}", config.to_toml_string()?),
    }
    Ok(())
}
