use std::{net::SocketAddr, process, sync::Arc, time::Duration};

use murmur::{
    application::{
        engagement::{EngagementDeduper, EngagementWindows},
        error::AppError,
        presence::PresenceStore,
    },
    cache::{BackendConfig, ConnectedBackend, MemoryBackend},
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(InfraError::from)?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::CheckCache(_) => run_check_cache(settings).await,
    }
}

async fn connect_backend(settings: &config::Settings) -> Result<ConnectedBackend, AppError> {
    let backend_config = BackendConfig::from(&settings.cache);
    let backend = ConnectedBackend::connect(&backend_config)
        .await
        .map_err(|err| AppError::from(InfraError::cache(err)))?;
    info!(
        target = "murmur::cache",
        backend = backend.kind(),
        key_prefix = %backend_config.key_prefix,
        "Cache backend ready"
    );
    Ok(backend)
}

async fn run_check_cache(settings: config::Settings) -> Result<(), AppError> {
    let backend = connect_backend(&settings).await?;
    backend
        .shared()
        .ping()
        .await
        .map_err(|err| AppError::from(InfraError::cache(err)))?;
    info!(
        target = "murmur::cache",
        backend = backend.kind(),
        "Cache answered ping"
    );
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let backend = connect_backend(&settings).await?;
    let keys = BackendConfig::from(&settings.cache).key_namespace();
    let shared = backend.shared();

    let presence = PresenceStore::start(shared.clone(), &keys)
        .await
        .map_err(|err| AppError::from(InfraError::cache(err)))?;
    let engagement = EngagementDeduper::new(
        shared.clone(),
        keys,
        EngagementWindows::from(&settings.engagement),
    );

    let state = HttpState {
        presence: Arc::new(presence),
        engagement: Arc::new(engagement),
        cache: shared,
    };

    let sweep_handle = match &backend {
        ConnectedBackend::Memory(memory) => Some(spawn_memory_sweep(
            memory.clone(),
            settings.cache.sweep_interval,
        )),
        ConnectedBackend::Redis(_) => None,
    };

    let result = serve_http(&settings, state).await;

    if let Some(handle) = sweep_handle {
        handle.abort();
        let _ = handle.await;
    }

    result
}

fn spawn_memory_sweep(memory: Arc<MemoryBackend>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            memory.purge_expired();
        }
    })
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(target = "murmur::http", addr = %settings.server.addr, "Listening");

    let shutdown = Arc::new(Notify::new());
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.notified().await }
    });
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        joined = &mut server => return flatten_server_result(joined),
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(target = "murmur::http", error = %err, "Shutdown signal listener failed");
            }
        }
    }

    info!(
        target = "murmur::http",
        grace_seconds = settings.server.graceful_shutdown.as_secs(),
        "Shutting down"
    );
    shutdown.notify_one();

    // Open realtime sockets keep the server alive; stop waiting after the grace period.
    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => flatten_server_result(joined),
        Err(_) => {
            warn!(
                target = "murmur::http",
                "Graceful shutdown timed out; dropping remaining connections"
            );
            server.abort();
            Ok(())
        }
    }
}

fn flatten_server_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AppError::from(InfraError::from(err))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}
