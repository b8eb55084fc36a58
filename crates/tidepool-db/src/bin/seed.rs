//! # Seed Data Generator
//!
//! Populates a local store with demo tables for development.
//!
//! ## Usage
//! ```bash
//! # Generate 1,000 todos (default)
//! cargo run -p tidepool-db --bin seed
//!
//! # Generate custom amount
//! cargo run -p tidepool-db --bin seed -- --count 10000
//!
//! # Specify database path
//! cargo run -p tidepool-db --bin seed -- --db ./data/tidepool.db
//! ```
//!
//! ## Generated Tables
//! - `users` - a handful of people with timestamps
//! - `todos` - auto-increment keys, indexed on `done` and `priority`,
//!   each assigned to a user
//!
//! All rows are written as local changes, so a following sync pushes them.

use serde_json::json;
use std::env;
use tidepool_core::TableSchema;
use tidepool_db::migrations::migration_status;
use tidepool_db::{Database, DbConfig};
use tracing_subscriber::EnvFilter;

const USERS: &[&str] = &["ada", "grace", "linus", "barbara", "ken", "margaret"];

const VERBS: &[&str] = &["Write", "Review", "Fix", "Plan", "Test", "Ship", "Refactor"];

const SUBJECTS: &[&str] = &[
    "release notes",
    "sync backoff",
    "index migration",
    "conflict handler",
    "live dashboard",
    "onboarding flow",
    "export job",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tidepool=debug,sqlx=warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let mut count: usize = 1000;
    let mut db_path = String::from("./tidepool_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(1000);
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
                println!("Tidepool Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Number of todos to generate (default: 1000)");
                println!("  -d, --db <PATH>    Database file path (default: ./tidepool_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Tidepool Seed Data Generator");
    println!("============================");
    println!("Database: {}", db_path);
    println!("Todos:    {}", count);
    println!();

    let config = DbConfig::new(&db_path)
        .table(TableSchema::new("users").timestamps())
        .table(
            TableSchema::new("todos")
                .auto_increment()
                .index("done")
                .index("priority")
                .timestamps(),
        );
    let db = Database::new(config).await?;

    let (total, applied) = migration_status(db.pool()).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied ({}/{})", applied, total);

    let todos = db.table("todos")?;
    let existing = todos.count().await?;
    if existing > 0 {
        println!("⚠ Database already has {} todos", existing);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let users = db.table("users")?;
    users
        .bulk_put(
            USERS
                .iter()
                .map(|name| json!({"id": name, "name": name, "active": true}))
                .collect(),
        )
        .await?;
    println!("✓ Created {} users", USERS.len());

    println!();
    println!("Generating todos...");
    let start = std::time::Instant::now();

    let batch_size = 250;
    let mut generated = 0;
    while generated < count {
        let n = batch_size.min(count - generated);
        let batch = (generated..generated + n).map(generate_todo).collect();
        todos.bulk_add(batch).await?;
        generated += n;
        println!("  Generated {} todos...", generated);
    }

    let elapsed = start.elapsed();
    println!();
    println!("✓ Generated {} todos in {:?}", generated, elapsed);
    println!(
        "  Rate: {:.0} todos/second",
        generated as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    println!();
    println!("Verifying indexes...");
    let open = todos.query().where_eq("done", false).count().await?;
    println!("  Open todos: {}", open);
    let urgent = todos
        .query()
        .where_clause(tidepool_core::WhereClause::gte("priority", 4))
        .count()
        .await?;
    println!("  Priority >= 4: {}", urgent);

    let pending = db.change_tracker().count_pending(None).await?;
    println!("  Pending changes: {}", pending);

    println!();
    println!("✓ Seed complete!");

    Ok(())
}

/// Builds one deterministic todo from its sequence number.
fn generate_todo(seed: usize) -> serde_json::Value {
    let verb = VERBS[seed % VERBS.len()];
    let subject = SUBJECTS[(seed / VERBS.len()) % SUBJECTS.len()];

    json!({
        "title": format!("{} {} #{}", verb, subject, seed),
        "done": seed % 3 == 0,
        "priority": (seed * 7) % 5 + 1,
        "assignee": USERS[seed % USERS.len()],
    })
}
