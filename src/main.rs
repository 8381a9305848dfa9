use std::path::PathBuf;
use std::sync::Arc;

use lucid_core::config::RelayConfig;
use lucid_llm::HttpProvider;
use lucid_relay::Relay;
use lucid_store::Database;
use lucid_telemetry::TelemetryRecorder;

#[tokio::main]
async fn main() {
    lucid_telemetry::init_logging();

    tracing::info!("Starting lucid relay server");

    let config = RelayConfig::from_env();

    // Database path
    let data_dir = lucid_dir().join("database");
    std::fs::create_dir_all(&data_dir).expect("Failed to create database directory");
    let db_path = data_dir.join("lucid.db");

    let db = Database::open(&db_path).expect("Failed to open database");
    tracing::info!(path = %db_path.display(), "Database opened");

    // Telemetry gets its own file so its writer never contends with the
    // transcript store's connection.
    let (telemetry, _telemetry_task) = TelemetryRecorder::spawn(&data_dir.join("telemetry.db"))
        .expect("Failed to start telemetry recorder");

    let provider = Arc::new(HttpProvider::new(
        &config.inference,
        config.worker.idle_timeout,
    ));
    let relay = Arc::new(Relay::new(&config, provider, db, telemetry));

    let server_config = lucid_server::ServerConfig {
        port: config.server_port,
        ..Default::default()
    };
    let port = server_config.port;
    let _handle = lucid_server::start(server_config, Arc::clone(&relay))
        .await
        .expect("Failed to start server");

    tracing::info!(port = port, "lucid server ready");

    wait_for_signal().await;

    tracing::info!("Shutting down");
    let report = relay.coordinator.run(config.shutdown_deadline).await;
    relay.stop_pump();
    if report.forced > 0 {
        std::process::exit(1);
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl+c");
    }
}

fn lucid_dir() -> PathBuf {
    std::env::var("LUCID_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_home().join(".lucid"))
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
