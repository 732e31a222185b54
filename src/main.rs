use std::net::{IpAddr, SocketAddr};

use memory_mesh::{AppState, build_router, config::Config, utils};

#[tokio::main]
async fn main() {
    utils::init_tracing();

    // 加载配置
    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!(
        environment = config.environment.as_str(),
        async_embeddings = config.async_embeddings,
        "Starting memory-mesh API"
    );

    let state = AppState::build(config)
        .await
        .expect("Failed to initialize application state");

    // 在 API 进程内运行向量队列
    let run_queue = state.config.async_embeddings && state.config.embedding_worker_in_process;
    if run_queue {
        state.jobs.start().await;
    }

    let addr = SocketAddr::new(
        state.config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        state.config.server_port,
    );
    let jobs = state.jobs.clone();
    let app = build_router(state);

    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .expect("Failed to start server");

    if run_queue {
        jobs.stop().await;
    }
    tracing::info!("Server stopped");
}
