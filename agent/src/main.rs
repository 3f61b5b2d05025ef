use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout stays quiet: stdin is the launcher's pipe and everything the
    // agent reports flows through its own log routing
    let env_filter = EnvFilter::from_default_env()
        .add_directive("agent=info".parse()?)
        .add_directive("tokio_postgres=warn".parse()?);
    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let code = agent::supervisor::run().await;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
