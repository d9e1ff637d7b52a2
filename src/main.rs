use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use classgate::config::{has_flag, GateConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("classgate dev server\n\nUSAGE:\n  classgate [--port N] [--bind ADDR] [--seed-demo]\n\nOPTIONS:\n  --port N       HTTP port (env: CLASSGATE_HTTP_PORT, default 7878)\n  --bind ADDR    Listen address (env: CLASSGATE_BIND, default 127.0.0.1)\n  --seed-demo    Seed student/teacher/admin demo accounts (env: CLASSGATE_SEED_DEMO)\n\nENV:\n  CLASSGATE_MIN_PASSWORD_LEN    Minimum sign-up password length (default 6)\n  CLASSGATE_CONFIRM_TIMEOUT_MS  Wait for the provider to confirm sign-in/out (default 5000)\n");
        return Ok(());
    }

    // Init logging
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let config = GateConfig::from_env_and_args(&args);
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "classgate starting: RUST_LOG='{}', bind={}, http_port={}, min_password_len={}, seed_demo={}",
        rust_log, config.bind, config.http_port, config.min_password_len, config.seed_demo
    );

    classgate::server::run(config).await
}
