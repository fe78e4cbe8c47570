use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use popcorn_protocol::EventCodec;
use popcorn_telemetry::MetricsRecorder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admin::{self, AdminState};
use crate::app_server::AppServer;
use crate::assets::StaticAssetResolver;
use crate::broker::Broker;
use crate::client::{self, ClientRegistry};
use crate::config::ServerConfig;
use crate::consumer::{handle_consumer, ConsumerContext};
use crate::error::StartError;
use crate::event_bridge;
use crate::producer::handle_producer;

/// Accept connections until cancelled, one task per connection.
fn spawn_accept_loop<F, Fut>(
    role: &'static str,
    listener: TcpListener,
    cancel: CancellationToken,
    handler: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(TcpStream, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(role, %peer, "connection accepted");
                        tokio::spawn(handler(stream, cancel.child_token()));
                    }
                    Err(e) => {
                        tracing::warn!(role, error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        tracing::info!(role, "listener stopped");
    })
}

/// Bind every port and start the background tasks.
pub async fn start(
    config: ServerConfig,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, StartError> {
    config.validate()?;
    let cancel = CancellationToken::new();
    let clients = Arc::new(ClientRegistry::new(
        config.max_send_queue,
        config.client_timeout(),
    ));
    let broker = Arc::new(Broker::new(
        Arc::clone(&clients),
        config.subscribe_policy,
        metrics.clone(),
    ));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let apps = Arc::new(AppServer::new(event_tx, metrics.clone()));

    let mut tasks = vec![
        event_bridge::create_bridge(
            Arc::clone(&broker),
            metrics.clone(),
            event_rx,
            cancel.clone(),
        ),
        client::start_cleanup_task(
            Arc::clone(&clients),
            config.cleanup_interval(),
            cancel.clone(),
        ),
    ];

    let app_listener = TcpListener::bind((config.host.as_str(), config.app_port)).await?;
    let app_addr = app_listener.local_addr()?;
    let producer_apps = Arc::clone(&apps);
    let max_event_line = config.max_event_line;
    tasks.push(spawn_accept_loop("producer", app_listener, cancel.clone(), move |stream, cancel| {
        handle_producer(
            stream,
            EventCodec::with_max_line_length(max_event_line),
            Arc::clone(&producer_apps),
            cancel,
        )
    }));

    let client_listener = TcpListener::bind((config.host.as_str(), config.client_port)).await?;
    let client_addr = client_listener.local_addr()?;
    let ctx = ConsumerContext {
        broker: Arc::clone(&broker),
        apps: Arc::clone(&apps),
        heartbeat_interval: config.heartbeat_interval(),
        max_frame_payload: config.max_frame_payload,
        metrics: metrics.clone(),
    };
    tasks.push(spawn_accept_loop("consumer", client_listener, cancel.clone(), move |stream, cancel| {
        handle_consumer(stream, ctx.clone(), cancel)
    }));

    let admin_addr = match config.admin_port {
        Some(port) => {
            let listener = TcpListener::bind((config.host.as_str(), port)).await?;
            let addr = listener.local_addr()?;
            let router = admin::build_router(AdminState {
                broker: Arc::clone(&broker),
                apps: Arc::clone(&apps),
                assets: Arc::new(StaticAssetResolver::new(config.machine_dirs.clone())),
                metrics,
                started_at: Utc::now(),
            });
            let shutdown = cancel.clone();
            tasks.push(tokio::spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
                    .ok();
            }));
            Some(addr)
        }
        None => None,
    };

    tracing::info!(
        app_port = app_addr.port(),
        client_port = client_addr.port(),
        admin_port = admin_addr.map(|a| a.port()),
        "popcorn server started"
    );

    Ok(ServerHandle {
        app_addr,
        client_addr,
        admin_addr,
        broker,
        apps,
        cancel,
        tasks,
    })
}

/// Handle returned by `start()`. Keeps the listeners and background tasks
/// reachable for shutdown.
pub struct ServerHandle {
    pub app_addr: SocketAddr,
    pub client_addr: SocketAddr,
    pub admin_addr: Option<SocketAddr>,
    pub broker: Arc<Broker>,
    pub apps: Arc<AppServer>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting, close every connection and wait briefly for the
    /// listeners to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(_) => {}
                Err(_) => tracing::warn!("task did not stop in time"),
            }
        }
        tracing::info!("popcorn server stopped");
    }
}
