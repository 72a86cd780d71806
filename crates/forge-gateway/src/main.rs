//! `forge-gateway` binary entrypoint.
//!
//! This starts the Actix server using configuration from environment variables
//! (optionally layered over the YAML file named by `FORGE_GATEWAY_CONFIG`).

use forge_gateway::{serve, GatewayConfig};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Respect `RUST_LOG` if set; otherwise default to gateway-friendly info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::load()?;
    serve(config).await
}
