use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use trustlink::config::{has_flag, ServerConfig, USAGE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    // Init logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    let config = ServerConfig::from_env_and_args(&args)?;
    info!(
        target: "trustlink",
        "trustlink {} starting: RUST_LOG='{}', http_port={}, data_dir={:?}",
        env!("CARGO_PKG_VERSION"),
        rust_log,
        config.http_port,
        config.data_dir
    );

    trustlink::server::run_with_config(config).await
}
