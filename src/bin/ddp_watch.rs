use std::time::Duration;

use anyhow::Result;
use ddp_client::{ClientConfig, DdpClient, DdpEvent};
use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let host = std::env::var("DDP_HOST").unwrap_or_else(|_| "localhost:3000".to_string());
    let secure = std::env::var("DDP_SECURE").is_ok_and(|v| v == "1" || v == "true");
    let subscription = std::env::var("DDP_SUBSCRIPTION").ok();

    let client = DdpClient::new(ClientConfig::default());

    info!(host = %host, secure, "Connecting to DDP server");
    client.connect(&host, secure).await?;

    if let Ok(token) = std::env::var("DDP_TOKEN") {
        client.login_with_token(&token).await?;
        info!("Logged in with resume token");
    } else if let (Ok(username), Ok(password)) =
        (std::env::var("DDP_USERNAME"), std::env::var("DDP_PASSWORD"))
    {
        client.login_with_password(&username, &password).await?;
        info!(username = %username, "Logged in");
    }

    let mut events = client.events();

    if let Some(name) = subscription {
        client.subscribe(&name, &[])?.await?;
        info!(subscription = %name, "Subscription ready");
    }

    let mut liveness = tokio::time::interval(Duration::from_secs(5));
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    liveness.tick().await;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(DdpEvent::Added(item)) => info!(
                    collection = %item.collection,
                    id = %item.id,
                    fields = ?item.fields,
                    "Added"
                ),
                Some(DdpEvent::Changed(item)) => info!(
                    collection = %item.collection,
                    id = %item.id,
                    fields = ?item.fields,
                    cleared = ?item.cleared,
                    "Changed"
                ),
                Some(DdpEvent::Removed { id, collection }) => {
                    info!(collection = %collection, id = %id, "Removed")
                }
                Some(DdpEvent::Message(frame)) => info!(frame = %frame, "Message"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            _ = liveness.tick() => {
                if !client.is_alive() {
                    warn!(state = %client.state(), "Session is no longer alive");
                    break;
                }
            }
        }
    }

    client.disconnect();
    Ok(())
}
