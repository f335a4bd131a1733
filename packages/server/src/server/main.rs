// Main entry point for the orchestration server
//
// Exit codes: 0 normal shutdown, 1 uncaught panic or fatal runtime error,
// 2 invalid configuration at startup.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{Context, Result};
use server_core::kernel::jobs::{handlers, JobRunner, JobRunnerConfig};
use server_core::kernel::{scheduled_tasks, ServerDeps};
use server_core::{server::build_app, Config};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Commerce Sync Hub orchestration server");

    // Load configuration; invalid config is exit code 2.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration invalid");
            std::process::exit(2);
        }
    };
    tracing::info!("Configuration loaded");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build runtime");
            std::process::exit(1);
        }
    };

    // A panic that escapes the server is exit code 1, not the default 101.
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(run(config))));
    match outcome {
        Ok(Ok(())) => {
            tracing::info!("Shutdown complete");
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "server exited with error");
            std::process::exit(1);
        }
        Err(_) => {
            tracing::error!("server panicked");
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<()> {
    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Build shared dependencies and the handler registry
    let deps = ServerDeps::new(pool, &config).context("Failed to build dependencies")?;
    let registry = Arc::new(handlers::build_registry());

    // Start the job runner
    let runner_config = JobRunnerConfig {
        batch_size: config.job_batch_size,
        poll_interval: config.job_poll_interval,
        lease: config.job_lease,
        job_timeout: config.job_timeout(),
        ..JobRunnerConfig::default()
    };
    let runner = JobRunner::with_config(deps.clone(), registry, runner_config);
    let runner_shutdown = runner.shutdown_token();
    let runner_handle = tokio::spawn(runner.run());

    // Start scheduled tasks
    let mut scheduler = scheduled_tasks::start_scheduler(deps.clone())
        .await
        .context("Failed to start scheduler")?;

    // Build application
    let app = build_app(deps);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("Server error")?;

    // Drain background work before exiting 0.
    runner_shutdown.cancel();
    let _ = runner_handle.await;
    scheduler.shutdown().await.ok();

    Ok(())
}
