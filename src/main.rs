/// BDRS - BPN Directory Resolution Server
///
/// Serves the directory and management APIs over a durable BPN to DID
/// mapping store.

use bdrs_server::{
    config::{LogFormat, ServerConfig},
    context::AppContext,
    error::BdrsResult,
    jobs, server,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> BdrsResult<()> {
    // Load configuration (also reads .env)
    let config = ServerConfig::from_env()?;

    init_tracing(&config)?;

    // Print banner
    print_banner();

    // Create application context
    let ctx = Arc::new(AppContext::new(config).await?);

    // Start background jobs
    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::clone(&ctx)));
    let jobs = scheduler.start();

    // Serve until shutdown signal
    let result = server::serve((*ctx).clone()).await;

    for job in jobs {
        job.abort();
    }
    ctx.engine.shutdown();
    info!("BDRS stopped");

    result
}

fn init_tracing(config: &ServerConfig) -> BdrsResult<()> {
    let filter = config.logging.filter()?;

    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
    Ok(())
}

fn print_banner() {
    println!(
        r#"
    ____  ____  ____  _____
   / __ )/ __ \/ __ \/ ___/
  / __  / / / / /_/ /\__ \
 / /_/ / /_/ / _, _/___/ /
/_____/_____/_/ |_|/____/

        BPN Directory Resolution Server v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
