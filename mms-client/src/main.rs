use anyhow::{bail, Context, Result};
use mms_client::config::load_or_default;
use mms_client::{ConnectionManager, WsDialer};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::info;

const USAGE: &str = "usage: mms-client listen <channel>... | mms-client publish <channel> <text>";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mms_client=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path =
        std::env::var("MMS_CLIENT_CONFIG").unwrap_or_else(|_| "mms-client.toml".to_string());
    let config = load_or_default(&config_path)?.with_env_overrides();
    info!(url = %config.url, "MMS client starting...");

    let dialer = Arc::new(WsDialer::new(config.url.clone()).with_connect_timeout(config.handshake_timeout()));
    let client = ConnectionManager::new(config, dialer);

    match args.first().map(String::as_str) {
        Some("listen") if args.len() > 1 => {
            for channel in &args[1..] {
                client.subscribe(channel.as_str()).await?;
            }
            let mut broadcasts = client.listen();
            client.connect().await.context("Failed to connect to relay")?;

            loop {
                tokio::select! {
                    Some(broadcast) = broadcasts.next() => {
                        println!(
                            "[{}] #{} from {}: {}",
                            broadcast.header.channel,
                            broadcast.header.id,
                            broadcast.header.sender_id,
                            String::from_utf8_lossy(&broadcast.payload)
                        );
                    }
                    result = tokio::signal::ctrl_c() => {
                        result.context("Failed to listen for ctrl_c signal")?;
                        break;
                    }
                }
            }
        }
        Some("publish") if args.len() == 3 => {
            client.connect().await.context("Failed to connect to relay")?;
            let receipt = client
                .publish(args[1].as_str(), args[2].clone().into_bytes(), None)
                .await?;
            info!(
                message_id = receipt.message_id,
                latest_received_id = receipt.latest_received_id,
                "Published"
            );
        }
        _ => bail!(USAGE),
    }

    client.close().await?;
    info!("MMS client stopped");
    Ok(())
}
