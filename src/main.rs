use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use llmlb::config::Config;
use llmlb::health::HealthSupervisor;
use llmlb::logs::{LogBuffer, LogTee};
use llmlb::state::AppState;

async fn build_app(
    config: Arc<Config>,
    log_buffer: Arc<LogBuffer>,
) -> anyhow::Result<(axum::Router, AppState)> {
    let pool = llmlb::db::connect(&config.state_dir).await?;
    let state = AppState::new(pool, Arc::clone(&config), log_buffer).await?;

    llmlb::auth::ensure_bootstrap_admin(&state.db)
        .await
        .map_err(|e| anyhow::anyhow!("bootstrap admin failed: {e}"))?;

    // ── Background tasks ────────────────────────────────────────────
    llmlb::system_monitor::spawn(state.system_monitor.clone());
    HealthSupervisor::new(
        Arc::clone(&state.registry),
        state.client.clone(),
        Arc::clone(&config),
        state.secrets.clone(),
    )
    .spawn();
    spawn_update_schedule(state.clone());

    // CORS — same-origin dashboard plus local dev servers.
    let cors = CorsLayer::new()
        .allow_origin([
            "http://localhost:5173".parse::<HeaderValue>().unwrap(),
            "http://127.0.0.1:5173".parse::<HeaderValue>().unwrap(),
        ])
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            "x-csrf-token".parse().unwrap(),
        ])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(86_400));

    // Security headers
    let nosniff: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    let frame_deny: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    let referrer: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    // Per-IP rate limiting: 2/s refill, burst 60.
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(2)
        .burst_size(60)
        .finish()
        .expect("rate-limit config is valid");

    // Body cap sits just above the multipart cap so the proxy's own limit
    // is the one that answers.
    let body_limit = config.multipart_cap_bytes + 1024 * 1024;

    let app = llmlb::create_router(state.clone())
        .layer(GovernorLayer::new(governor_conf))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors)
        .layer(nosniff)
        .layer(frame_deny)
        .layer(referrer)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = tracing::field::Empty,
                )
            }),
        )
        .layer(CompressionLayer::new());

    Ok((app, state))
}

/// Daily update schedule: when dashboard_settings.update_schedule matches
/// the current UTC HH:MM, run check + apply (drain, then shutdown).
fn spawn_update_schedule(state: AppState) {
    tokio::spawn(async move {
        let mut last_fired = String::new();
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            let Ok(Some(at)) = sqlx::query_scalar::<_, Option<String>>(
                "SELECT update_schedule FROM dashboard_settings WHERE id = 1",
            )
            .fetch_one(&state.db)
            .await
            else {
                continue;
            };
            let now = chrono::Utc::now().format("%H:%M").to_string();
            if at == now && last_fired != now {
                last_fired = now;
                tracing::info!("scheduled update slot reached, draining");
                let outcome = state.gate.drain(state.config.drain_timeout).await;
                tracing::info!(?outcome, "scheduled drain finished, signalling shutdown");
                state.gate.set_state(llmlb::gate::UpdateState::Applying);
                state.shutdown.notify_waiters();
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env());

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None | Some("serve") => {
            let mut config = (*config).clone();
            // serve [--port N] [--host H] override the environment.
            let rest: Vec<String> = args.collect();
            let mut it = rest.iter();
            while let Some(flag) = it.next() {
                match flag.as_str() {
                    "--port" => {
                        if let Some(p) = it.next().and_then(|v| v.parse().ok()) {
                            config.port = p;
                        }
                    }
                    "--host" => {
                        if let Some(h) = it.next() {
                            config.host = h.clone();
                        }
                    }
                    other => anyhow::bail!("unknown flag: {other}"),
                }
            }
            serve(Arc::new(config)).await
        }
        Some("__internal") => {
            // `__internal apply-update` is invoked by the update coordinator
            // after drain; the binary swap itself lives in the updater.
            match args.next().as_deref() {
                Some("apply-update") => {
                    eprintln!("llmlb: apply-update handed over to the platform updater");
                    Ok(())
                }
                other => anyhow::bail!("unknown internal command: {other:?}"),
            }
        }
        Some(other) => anyhow::bail!("unknown command: {other} (try: serve)"),
    }
}

async fn serve(config: Arc<Config>) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let env_filter = std::env::var("LLM_LOG_LEVEL")
        .ok()
        .and_then(|lvl| lvl.parse::<EnvFilter>().ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| "info".into());

    let log_buffer = LogBuffer::new();
    let tee = LogTee::new(
        Arc::clone(&log_buffer),
        config.log_dir.clone(),
        config.log_retention_days,
    );
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(tee)
        .init();

    if !config.jwt_secret_from_env {
        tracing::warn!(
            "LLMLB_JWT_SECRET is not set — using an ephemeral secret; sessions and sealed \
             endpoint keys will not survive a restart"
        );
    }

    let (app, state) = build_app(Arc::clone(&config), Arc::clone(&log_buffer)).await?;

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("llmlb listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await?;

    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = tokio::signal::ctrl_c();
    let update = state.shutdown.notified();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
            _ = update => {},
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = ctrl_c => {},
            _ = update => {},
        }
    }
    tracing::info!("shutdown signal received, starting graceful shutdown");
}
