mod collectors;
mod config;
mod http;
mod metrics;
mod proxmox;
mod state;

use axum::serve;
use clap::Parser;
use collectors::guests::{CycleOutcome, GuestCollector};
use config::Config;
use metrics::Metrics;
use proxmox::ProxmoxClient;
use state::State;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pvewatch")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Run a single poll cycle, print the published state as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let client = match ProxmoxClient::new(&cfg.proxmox) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "не удалось создать HTTP-клиент");
            std::process::exit(1);
        }
    };
    if !cfg.proxmox.verify_tls {
        warn!(host = %cfg.proxmox.host, "проверка TLS-сертификата Proxmox отключена");
    }
    let collector = GuestCollector::new(client, &cfg.proxmox);
    let shared_state = Arc::new(RwLock::new(State::new(now_unix(), cfg.proxmox.name.clone())));

    if cli.once {
        std::process::exit(run_once(&collector, &shared_state).await);
    }

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        host = %cfg.proxmox.host,
        name = %cfg.proxmox.name,
        "запуск pvewatch"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, http_state);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let collector_task = {
        let metrics = metrics.clone();
        let shared_state = shared_state.clone();
        let mut shutdown = shutdown_rx.clone();
        let interval_secs = cfg.interval_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки цикла опроса");
                        break;
                    }
                    _ = ticker.tick() => {
                        let outcome = collector.poll_cycle(&shared_state).await;
                        metrics.record_cycle(outcome);
                        let snapshot = shared_state.read().await.clone();
                        metrics.update_from_state(&snapshot);
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = collector_task.await;
    let _ = http_task.await;
}

async fn run_once(collector: &GuestCollector, state: &RwLock<State>) -> i32 {
    let outcome = collector.poll_cycle(state).await;
    let guard = state.read().await;
    match serde_json::to_string_pretty(&http::ApiState::from(&*guard)) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            error!(error = %err, "не удалось сериализовать состояние");
            return 2;
        }
    }
    match outcome {
        CycleOutcome::Updated { .. } => 0,
        CycleOutcome::Failed(_) => 1,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
