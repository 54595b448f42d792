// Update hub
// Decision: The hub owns shared dependencies; each connect spawns an independent session task
// Decision: Server shutdown cancels a root token; every session holds a child token

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::frames::StreamFrame;
use crate::resolver::UpdateResolver;
use crate::session::{ConnectParams, DeliverySession, SessionConfig, SessionOutcome};
use crate::traits::{Broadcaster, EventLog, ReadModel};

/// A connected client: frames to forward, plus the running session task
pub struct SessionHandle {
    pub frames: mpsc::Receiver<StreamFrame>,
    pub task: JoinHandle<SessionOutcome>,
}

#[derive(Clone)]
pub struct UpdateHub {
    log: Arc<dyn EventLog>,
    broadcaster: Arc<dyn Broadcaster>,
    resolver: UpdateResolver,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl UpdateHub {
    pub fn new(
        log: Arc<dyn EventLog>,
        broadcaster: Arc<dyn Broadcaster>,
        read_model: Arc<dyn ReadModel>,
        config: SessionConfig,
    ) -> Self {
        Self {
            log,
            broadcaster,
            resolver: UpdateResolver::new(read_model),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    pub fn broadcaster(&self) -> &Arc<dyn Broadcaster> {
        &self.broadcaster
    }

    /// Token cancelled by `shutdown`
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every open session
    pub fn shutdown(&self) {
        tracing::info!("Closing all delivery sessions");
        self.shutdown.cancel();
    }

    /// Open a session for one client
    ///
    /// Dropping the returned receiver disconnects the session.
    pub fn connect(&self, params: ConnectParams) -> SessionHandle {
        let (tx, frames) = mpsc::channel(self.config.frame_buffer);
        let session = DeliverySession::new(
            params,
            self.log.clone(),
            self.broadcaster.clone(),
            self.resolver.clone(),
            self.config.clone(),
            tx,
            self.shutdown.child_token(),
        );
        let task = tokio::spawn(session.run());
        SessionHandle { frames, task }
    }
}
