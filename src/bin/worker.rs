use memory_mesh::{
    AppState,
    config::Config,
    jobs::{WorkerExit, run_worker},
    utils,
};

#[tokio::main]
async fn main() {
    utils::init_tracing();

    let config = Config::from_env().expect("Failed to load configuration");
    let state = AppState::build(config)
        .await
        .expect("Failed to initialize embedding worker");

    tracing::info!(embedder = state.embedder.name(), "Starting embedding worker");
    match run_worker(&state.config, state.jobs.clone(), utils::shutdown_signal()).await {
        WorkerExit::Disabled => tracing::info!("Embedding worker exited without running"),
        WorkerExit::Stopped => tracing::info!("Embedding worker stopped"),
    }
}
