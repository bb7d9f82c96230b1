use anyhow::Context;
use dotenv::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use ws_session::{session_from_settings, SessionError, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Load configuration
    let mut config = Settings::new().context("Failed to load configuration")?;
    if let Some(url) = std::env::args().nth(1) {
        config.client.url = url;
    }

    // Initialize logging, RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .init();
    info!("Configuration loaded successfully");

    let session = session_from_settings(&config).context("Invalid client target")?;
    info!("Session {} targeting {}", session.id(), config.client.url);

    session.set_on_connect(|| println!("* connected"));
    session.set_on_text(|text| println!("< {}", text));
    session.set_on_data(|data| println!("< {} bytes of binary data", data.len()));
    session.set_on_disconnect(|error: Option<&SessionError>| match error {
        Some(e) => println!("* disconnected: {}", e),
        None => println!("* disconnected"),
    });

    session.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = session.write_text(line) {
                        warn!("Dropped message: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
            _ = session.closed() => break,
        }
    }

    session.disconnect();
    session.closed().await;

    match session.error() {
        Some(e) => Err(e).context("Session ended with an error"),
        None => Ok(()),
    }
}
