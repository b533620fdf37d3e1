use clap::Parser;
use sideboard::{Server, build_router, config};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sideboard", about = "Multi-tenant RPC host")]
struct Args {
    /// Config file(s), merged in order; later files win.  Appended after
    /// any files named in SIDEBOARD_CONFIG_FILES.
    #[arg(long = "config")]
    config: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Explicitly select the ring backend; with more than one rustls
    // provider compiled in, TLS setup panics without an installed default.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| format!("failed to install rustls crypto provider: {e:?}"))?;

    let args = Args::parse();
    let mut paths: Vec<PathBuf> = std::env::var(format!("{}_CONFIG_FILES", config::ENV_PREFIX))
        .unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect();
    paths.extend(args.config);
    let config = config::load_config_from(&paths, std::env::vars())?;

    let listen = config.listen.clone();
    let server = Server::new(config);
    server.register_remote_services()?;
    server.startup();

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(listen = %listen, "sideboard listening");

    let app = build_router(server.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    server.shutdown();
    Ok(())
}
