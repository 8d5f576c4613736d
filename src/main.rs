mod api;
mod config;
mod sandbox;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::sandbox::deps::DependencyCache;
use crate::sandbox::manager::PreviewManager;
use crate::sandbox::types::ProviderKind;

#[derive(Parser)]
#[command(name = "previewd", about = "Ephemeral preview sandbox manager")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Build the shared dependency cache and exit
    WarmDeps,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but still let
    // --help and --version work.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve
    } else {
        Cli::parse()
    };

    match cli {
        Cli::Serve => run_server().await,
        Cli::WarmDeps => warm_deps().await,
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("previewd=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();
}

fn build_deps_cache(config: &config::Config) -> Arc<DependencyCache> {
    Arc::new(DependencyCache::new(
        config.deps_cache_dir.clone(),
        config.deps_base_package.clone(),
        config.deps_warm_command(),
    ))
}

async fn run_server() -> Result<()> {
    let config = config::Config::from_env();

    init_tracing();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    let deps = build_deps_cache(&config);

    if config.prewarm_deps && config.provider == ProviderKind::Local {
        if let Err(e) = deps.ensure_warm().await {
            tracing::warn!(error = %e, "dependency cache prewarm failed, will retry on first preview");
        }
    }

    let provider = sandbox::build_provider(config.provider_runtime(), deps)?;
    let manager = PreviewManager::new(provider, config.manager_config());

    let app = api::build_router(api::AppState {
        manager: manager.clone(),
    })
    .layer(SentryHttpLayer::new().enable_transaction())
    .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let port = config.port;
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Tear down every live preview so cloud sandboxes don't outlive us.
    tracing::info!("shutting down, destroying live previews");
    manager.destroy_all().await;

    Ok(())
}

async fn warm_deps() -> Result<()> {
    let config = config::Config::from_env();
    init_tracing();

    let deps = build_deps_cache(&config);
    deps.ensure_warm().await?;
    println!(
        "Dependency cache ready at {}",
        config.deps_cache_dir.display()
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
