//! voxlink smoke binary.
//!
//! Runs one session against an in-process echo agent over the loopback
//! transport: loads configuration, initialises structured logging, fetches
//! a credential (from the configured token endpoint, or a static development
//! credential when none is set), sends a greeting, logs every session event,
//! and ends the session on SIGTERM/SIGINT.

mod agent;

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use voxlink_credentials::{CredentialSource, HttpCredentialSource, StaticCredentialSource};
use voxlink_delivery::DeliveryEvent;
use voxlink_runtime::SystemClock;
use voxlink_session::{Config, SessionCoordinator, SessionDeps, StartOptions};
use voxlink_transport::{LoopbackTransport, Transport};
use voxlink_types::Credential;

const DEV_ROOM: &str = "voxlink-smoke";

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("VOXLINK_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn credential_source(config: &Config) -> Arc<dyn CredentialSource> {
    let url = config.credentials.token_url.trim();
    if url.is_empty() {
        tracing::info!("no token endpoint configured, using a static development credential");
        return Arc::new(StaticCredentialSource::new(Credential {
            value: "dev-token".to_string(),
            expires_at_ms: None,
            server_url: "loopback://local".to_string(),
            room_name: DEV_ROOM.to_string(),
            participant_name: "smoke-user".to_string(),
        }));
    }

    tracing::info!(token_url = url, "fetching credentials from token endpoint");
    Arc::new(
        HttpCredentialSource::new(url, config.credentials.request_timeout())
            .expect("failed to build HTTP client for the token endpoint"),
    )
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("voxlink.toml"));

    // Load configuration
    let config = voxlink_session::load_config(selected_config_path)
        .expect("failed to load configuration: the session cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Both ends of the session live in this process.
    let (user_side, agent_side) = LoopbackTransport::pair();
    let agent = agent::EchoAgent::spawn(agent_side, DEV_ROOM, config.delivery.clone())
        .await
        .expect("failed to connect the echo agent");

    let deps = SessionDeps {
        credentials: credential_source(&config),
        transports: Arc::new(move || Arc::new(user_side.clone()) as Arc<dyn Transport>),
        clock: Arc::new(SystemClock),
    };
    let session = SessionCoordinator::new(deps, config);
    let observers = spawn_observers(&session);

    let started = session
        .start(StartOptions {
            user_id: None,
            display_name: Some("smoke".to_string()),
        })
        .await;

    match started {
        Ok(()) => {
            match session.send_message("hello from voxlink-smoke") {
                Ok(id) => tracing::info!(message_id = %id, "greeting queued"),
                Err(e) => tracing::error!(error = %e, "failed to queue greeting"),
            }
            shutdown_signal().await;
        }
        Err(e) => {
            tracing::error!(category = e.category().code(), "session failed to start: {}", e);
        }
    }

    session.end().await;
    agent.stop().await;
    for observer in observers {
        observer.abort();
    }

    tracing::info!("voxlink smoke run finished");
}

/// Logs the session's three event streams.
fn spawn_observers(session: &SessionCoordinator) -> Vec<tokio::task::JoinHandle<()>> {
    let snapshots = observe(session.subscribe_snapshots(), |snapshot| {
        tracing::info!(
            phase = ?snapshot.phase,
            connection = %snapshot.connection,
            remote_typing = snapshot.remote_typing,
            "session snapshot"
        );
    });
    let messages = observe(session.subscribe_messages(), |event| match event {
        DeliveryEvent::MessageReceived(message) => {
            tracing::info!(
                from = message.sender_name.as_deref().unwrap_or(&message.sender_id),
                text = %message.text,
                "message received"
            );
        }
        DeliveryEvent::StatusChanged {
            message_id,
            status,
            attempts,
            terminal,
        } => {
            tracing::info!(%message_id, ?status, attempts, terminal, "message status");
        }
        _ => {}
    });
    let errors = observe(session.subscribe_errors(), |error| {
        tracing::warn!(
            category = error.category.code(),
            message_id = ?error.message_id,
            "{}",
            error.message
        );
    });
    vec![snapshots, messages, errors]
}

fn observe<T, F>(mut rx: broadcast::Receiver<T>, handle: F) -> tokio::task::JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => handle(item),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        () = ctrl_c => { tracing::info!("received SIGINT, ending session"); }
        () = terminate => { tracing::info!("received SIGTERM, ending session"); }
    }
}
