//! In-process echo agent on the far end of the loopback link.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use voxlink_delivery::{DeliveryEngine, DeliveryEvent, DeliverySettings, LocalIdentity};
use voxlink_runtime::SystemClock;
use voxlink_transport::{ConnectTarget, ConnectionError, ConnectionManager, ConnectionSettings, LoopbackTransport};

/// Pause between seeing a message and answering it, spent "typing".
const REPLY_DELAY: Duration = Duration::from_millis(400);

pub struct EchoAgent {
    engine: DeliveryEngine,
    connection: ConnectionManager,
    replies: JoinHandle<()>,
}

impl EchoAgent {
    /// Connects the agent's side of the link and starts answering.
    pub async fn spawn(
        transport: LoopbackTransport,
        room_name: &str,
        settings: DeliverySettings,
    ) -> Result<Self, ConnectionError> {
        let connection = ConnectionManager::new(Arc::new(transport), ConnectionSettings::default());
        connection
            .connect(ConnectTarget {
                server_url: "loopback://agent".to_string(),
                room_name: room_name.to_string(),
                token: "agent".to_string(),
            })
            .await?;

        let engine = DeliveryEngine::attach(
            connection.clone(),
            LocalIdentity {
                id: "agent".to_string(),
                name: Some("Echo agent".to_string()),
            },
            settings,
            Arc::new(SystemClock),
        );
        let replies = tokio::spawn(answer(engine.clone(), engine.subscribe()));
        tracing::info!(room = room_name, "echo agent joined");

        Ok(Self {
            engine,
            connection,
            replies,
        })
    }

    pub async fn stop(self) {
        self.replies.abort();
        self.engine.shutdown();
        self.connection.shutdown().await;
        tracing::info!("echo agent left");
    }
}

async fn answer(engine: DeliveryEngine, mut events: broadcast::Receiver<DeliveryEvent>) {
    loop {
        match events.recv().await {
            Ok(DeliveryEvent::MessageReceived(message)) => {
                engine.set_typing(true).await;
                tokio::time::sleep(REPLY_DELAY).await;
                if let Err(e) = engine.send(&format!("echo: {}", message.text)) {
                    tracing::warn!(error = %e, "echo agent could not reply");
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "echo agent fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
