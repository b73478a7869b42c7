//! # Seed Data Generator
//!
//! Populates the database with channels full of chat history for
//! development.
//!
//! ## Usage
//! ```bash
//! # 3 channels x 150 messages (default)
//! cargo run -p huddle-db --bin seed
//!
//! # Custom amount
//! cargo run -p huddle-db --bin seed -- --count 500
//!
//! # Specify database path
//! cargo run -p huddle-db --bin seed -- --db ./data/huddle.db
//! ```
//!
//! ## Generated Data
//! - Channels: `general`, `random`, `engineering`
//! - Messages rotate through a small cast of senders
//! - Every 10th message gets a short thread of replies
//! - Every 7th message is edited, every 25th soft-deleted
//! - Reactions are sprinkled from a fixed emoji palette

use std::env;

use huddle_core::{MessagePatch, NewMessage, NewReaction};
use huddle_db::{Database, DbConfig};
use tracing_subscriber::EnvFilter;

const CHANNELS: &[&str] = &["general", "random", "engineering"];

const SENDERS: &[&str] = &["alice", "bob", "carol", "dave", "erin"];

const EMOJI: &[&str] = &["👍", "🎉", "😂", "👀", "🚀"];

const LINES: &[&str] = &[
    "Morning all",
    "Has anyone looked at the deploy?",
    "Pushing a fix now",
    "Lunch?",
    "Standup in 5",
    "Can someone review my PR",
    "That test is flaky again",
    "Shipping it",
    "Nice work on the release",
    "Back in 10",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,huddle=debug,sqlx=warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let mut count: usize = 150;
    let mut db_path = String::from("./huddle_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(150);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Huddle Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Messages per channel (default: 150)");
                println!("  -d, --db <PATH>    Database file path (default: ./huddle_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 Huddle Seed Data Generator");
    println!("============================");
    println!("Database: {}", db_path);
    println!("Messages per channel: {}", count);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;

    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = db.messages().count(CHANNELS[0]).await?;
    if existing > 0 {
        println!("⚠ Channel '{}' already has {} messages", CHANNELS[0], existing);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let start = std::time::Instant::now();
    let mut generated = 0usize;
    let mut reactions = 0usize;

    for channel in CHANNELS {
        println!();
        println!("Seeding #{}...", channel);

        for n in 0..count {
            let sender = SENDERS[n % SENDERS.len()];
            let body = format!("{} ({})", LINES[n % LINES.len()], n);
            let message = db
                .messages()
                .insert(&NewMessage::new(*channel, Some(sender.to_string()), body))
                .await?;
            generated += 1;

            if n % 10 == 0 {
                for r in 0..3 {
                    let replier = SENDERS[(n + r + 1) % SENDERS.len()];
                    let reply = NewMessage::new(*channel, Some(replier.to_string()), "+1")
                        .in_thread(&message.id);
                    db.messages().insert(&reply).await?;
                    generated += 1;
                }
            }

            for (k, emoji) in EMOJI.iter().enumerate().take(n % 4) {
                let reactor = SENDERS[(n + k) % SENDERS.len()];
                if let Err(e) = db
                    .reactions()
                    .insert(&NewReaction::new(&message.id, reactor, *emoji))
                    .await
                {
                    eprintln!("Failed to react to {}: {}", message.id, e);
                    continue;
                }
                reactions += 1;
            }

            if n % 7 == 3 {
                db.messages()
                    .update(&message.id, &MessagePatch::edit(format!("{} (edited)", message.content)))
                    .await?;
            }

            if n % 25 == 24 {
                db.messages().soft_delete(&message.id).await?;
            }
        }

        println!("  {} visible messages", db.messages().count(channel).await?);
    }

    let elapsed = start.elapsed();
    println!();
    println!(
        "✓ Generated {} messages and {} reactions in {:?}",
        generated, reactions, elapsed
    );
    println!("✓ Seed complete!");

    Ok(())
}
