use std::error::Error;

use botdash_realtime::{KillSwitchTopic, LogTopic, RealtimeClient};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let token = "REPLACE_WITH_SESSION_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = RealtimeClient::from_env()?;

        client.on_event::<KillSwitchTopic, _>(|entry| {
            println!(
                "KILL SWITCH symbol={} message={}",
                entry.symbol.as_deref().unwrap_or("-"),
                entry.message,
            );
        });
        client.on_event::<LogTopic, _>(|entry| {
            println!(
                "[{}] {}",
                entry.level.as_deref().unwrap_or("info"),
                entry.message
            );
        });

        client.connect(SecretString::new(token));
        tokio::signal::ctrl_c().await?;
        client.disconnect();

        Ok::<(), Box<dyn Error>>(())
    })
}
