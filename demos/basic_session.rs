//! Basic session example
//!
//! Usage:
//!   VENUE_EMAIL=... VENUE_PASSWORD=... cargo run --example basic_session

use std::sync::Arc;
use venue_rs_client::{ApiClient, ClientConfig, Navigator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Configuration (VENUE_API_URL, VENUE_TOKEN_FILE)
    let config = ClientConfig::from_env();
    let email = std::env::var("VENUE_EMAIL").unwrap_or_else(|_| "admin@example.com".to_string());
    let password = std::env::var("VENUE_PASSWORD").unwrap_or_else(|_| "admin".to_string());

    println!("=== Venue Rust Client Example ===");
    println!("API: {}", config.base_url);
    println!();

    let store = config.open_token_store();
    let navigator: Arc<dyn Navigator> = Arc::new(|route: &str| {
        println!("! Session ended, please sign in again ({route})");
    });
    let client = ApiClient::new(config, store, navigator)?;

    if client.is_authenticated() {
        println!("✓ Reusing stored session");
    } else {
        println!("Logging in as {email}...");
        client.login(&email, &password).await?;
        println!("✓ Logged in");
    }
    println!();

    let me = client.current_user().await?;
    println!("Signed in as {} <{}> ({:?})", me.name, me.email, me.role);
    println!();

    // Fire a few requests at once; an expired access token is renewed once
    // and every request is replayed with the new one
    let (menus, tables, orders) = tokio::join!(
        client.get_json::<serde_json::Value>("/menus"),
        client.get_json::<serde_json::Value>("/tables"),
        client.get_json::<serde_json::Value>("/orders"),
    );

    for (name, result) in [("menus", menus), ("tables", tables), ("orders", orders)] {
        match result {
            Ok(serde_json::Value::Array(items)) => println!("✓ {name}: {} entries", items.len()),
            Ok(other) => println!("✓ {name}: {other}"),
            Err(e) => println!("! {name}: {e}"),
        }
    }

    Ok(())
}
