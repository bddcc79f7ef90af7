//! BeTrace Server - Main entry point
//!
//! Behavioral-assurance trace processor.

use std::net::SocketAddr;
use std::sync::Arc;

use betrace_core::{
    api::{self, AppState, InputScreen},
    config::Config,
    observability,
    pipeline::{self, http_receiver_router, run_grpc_receiver, OtlpExporter, Pipeline, SpanIngest},
    rules::RuleRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration; a broken config is the only fatal error.
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    // Initialize observability
    let prometheus = observability::init(pipeline::SERVICE_NAME, &config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        tenant = %config.tenant.id,
        "Starting BeTrace server"
    );

    // Shared components
    let registry = Arc::new(RuleRegistry::new(config.tenant.id.clone()));
    let exporter = Arc::new(OtlpExporter::new(config.export.clone()));
    let pipeline = Pipeline::new(config.clone(), registry.clone(), exporter);
    let handle = pipeline.start();

    let ingest = SpanIngest::new(config.tenant.id.clone(), pipeline.ingest_sender());

    // OTLP gRPC receiver
    let grpc_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.otlp_grpc_port)
        .parse()?;
    let grpc_shutdown = shutdown_signal();
    let grpc_task = tokio::spawn(run_grpc_receiver(ingest.clone(), grpc_addr, grpc_shutdown));

    // OTLP HTTP/protobuf receiver
    let http_otlp_addr: SocketAddr =
        format!("{}:{}", config.server.host, config.server.otlp_http_port).parse()?;
    let otlp_router = http_receiver_router(ingest);
    tracing::info!(address = %http_otlp_addr, "OTLP HTTP receiver listening");
    let otlp_listener = tokio::net::TcpListener::bind(http_otlp_addr).await?;
    let otlp_task = tokio::spawn(async move {
        axum::serve(otlp_listener, otlp_router)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    // Control plane
    let app_state = AppState {
        registry,
        assembler: pipeline.assembler(),
        pool: pipeline.pool(),
        cache: pipeline.cache(),
        screen: Arc::new(InputScreen::default()),
        prometheus: Some(prometheus),
    };
    let app = api::build_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.http_port).parse()?;
    tracing::info!(address = %addr, "Control plane listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Receivers are stopping; wait for them so their ingest senders drop,
    // then drain the pipeline.
    let _ = grpc_task.await;
    let _ = otlp_task.await;
    pipeline.shutdown(handle).await;

    observability::shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
