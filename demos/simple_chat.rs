//! Simple chat example with two nodes on one host.
//!
//! This example shows how to:
//! - Start two nodes in local mode on a loopback port range
//! - Wait for LAN discovery and the secure channel
//! - Send a private message and a group message

use overlay_messenger::{App, AppEvent, MessengerConfig};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};

fn config_for(username: &str) -> MessengerConfig {
    let mut config = MessengerConfig::default();
    config.identity.username = username.to_string();
    config.network.base_port = 43100;
    config.network.port_range = 4;
    config.network.broadcast_address = [127, 0, 0, 1].into();
    config.discovery.beacon_interval_ms = 500;
    config
}

async fn next_matching(
    events: &mut UnboundedReceiver<AppEvent>,
    wanted: impl Fn(&AppEvent) -> bool,
) -> Result<AppEvent, Box<dyn std::error::Error>> {
    let found = timeout(Duration::from_secs(30), async {
        while let Some(event) = events.recv().await {
            println!("   event: {}", event.name());
            if wanted(&event) {
                return Some(event);
            }
        }
        None
    })
    .await?;
    found.ok_or_else(|| "event channel closed".into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Overlay Messenger - Simple Chat Example");
    println!("=======================================");

    println!("Starting alice and bob...");
    let (alice, mut alice_events) = App::start(config_for("alice")).await?;
    let (bob, mut bob_events) = App::start(config_for("bob")).await?;
    println!("   alice on port {}, bob on port {}", alice.port(), bob.port());

    println!("\nWaiting for the secure channel...");
    next_matching(&mut alice_events, |e| {
        matches!(e, AppEvent::SecureChannelEstablished { username } if username == "bob")
    })
    .await?;

    println!("\nalice -> bob");
    alice
        .send_private_message("bob", json!({"id": uuid::Uuid::new_v4().to_string(), "text": "hi bob"}))
        .await?;
    if let AppEvent::MessageReceived { from, message } =
        next_matching(&mut bob_events, |e| matches!(e, AppEvent::MessageReceived { .. })).await?
    {
        println!("   bob got {message} from {from}");
    }

    println!("\nalice creates a group and invites bob");
    let group_id = alice.create_group("demo").await;
    alice.invite_to_group(&group_id, "bob").await?;
    next_matching(&mut bob_events, |e| matches!(e, AppEvent::GroupInvite { .. })).await?;
    bob.respond_group_invite(&group_id, true).await?;
    next_matching(&mut bob_events, |e| matches!(e, AppEvent::GroupJoined { .. })).await?;

    bob.send_group_message(&group_id, json!({"text": "hello group"})).await?;
    next_matching(&mut alice_events, |e| matches!(e, AppEvent::GroupMessageReceived { .. })).await?;
    println!("   members: {:?}", alice.members(&group_id).await.unwrap_or_default());

    let stats = alice.stats().await;
    println!("\nalice: {} peers, {} secure", stats.known_peers, stats.secure_peers);

    println!("\nShutting down...");
    alice.shutdown().await;
    bob.shutdown().await;
    println!("Shutdown complete");

    Ok(())
}
