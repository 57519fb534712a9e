use std::error::Error;
use std::sync::Arc;

use irccloud_sdk::{ApiClient, BotBuilder, BotOptions, HandlerError, HttpTransport};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let email = std::env::var("IRCCLOUD_EMAIL")?;
    let password = SecretString::new(std::env::var("IRCCLOUD_PASSWORD")?);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let transport = Arc::new(HttpTransport::new()?);
        let client = ApiClient::login(transport, &email, &password).await?;

        let shutdown = CancellationToken::new();
        let ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            ctrl_c.cancel();
        });

        let mut bot = BotBuilder::new(client)
            .options(BotOptions::default().with_drop_unhandled_events(true))
            .on("buffer_msg", |event| async move {
                if event.from_backlog() || event.is_self() {
                    return Ok::<(), HandlerError>(());
                }
                let msg = event.str("msg")?;
                if let Some(text) = msg.strip_prefix("!echo ") {
                    event.reply(text).await?;
                }
                Ok::<(), HandlerError>(())
            })
            .start(shutdown)?;

        while let Some(event) = bot.recv().await {
            println!(
                "type={} cid={:?} backlog={}",
                event.event_type(),
                event.cid().ok(),
                event.from_backlog()
            );
        }

        if let Some(err) = bot.err().await {
            eprintln!("stream terminated: {err}");
            let mut source = err.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
        }
        Ok::<(), Box<dyn Error>>(())
    })
}
