#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(unix))]
compile_error!("Only unix targets are currently supported");

use std::path::PathBuf;

use skyfall_smtp::{
    config::Options,
    events::TracingSink,
    internal, logging,
    server::{Listening, Server},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config_path = find_config_file()?;
    let options = Options::from_path(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load config from {}: {}",
            config_path.display(),
            e
        )
    })?;

    let server = Server::new(TracingSink);
    server.configure(options)?;

    let listening = server.start().await?;
    internal!(
        level = INFO,
        "Accepting connections on {}",
        listening.local_addr()
    );

    tokio::select! {
        r = serve(&listening) => r?,
        r = shutdown() => r?,
    }

    internal!(level = INFO, "Shutting down...");
    drop(listening);

    Ok(())
}

async fn serve(listening: &Listening) -> skyfall_smtp::Result<()> {
    let resolver = listening.resolver();

    loop {
        // Without a protocol engine attached, connections are only admitted
        // or refused, then closed
        let (_stream, session) = listening.accept().await?;

        let verdict = resolver.connect(&session).await;
        internal!(level = INFO, "[{}] {:?}", session.id, verdict);
    }
}

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received");
        }
    };

    Ok(())
}

/// Find the configuration file using the following precedence:
/// 1. `SKYFALL_SMTP_CONFIG` environment variable
/// 2. ./skyfall-smtp.toml (current working directory)
/// 3. /etc/skyfall/smtp.toml (system-wide config)
fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("SKYFALL_SMTP_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "SKYFALL_SMTP_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./skyfall-smtp.toml"),
        PathBuf::from("/etc/skyfall/smtp.toml"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - SKYFALL_SMTP_CONFIG environment variable\n{paths_tried}"
    )
}
