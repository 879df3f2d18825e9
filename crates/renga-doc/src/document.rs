//! The public document handle and its session supervisor.
//!
//! A [`Document`] ties one editable body to one interpreter session. The
//! handle itself is cheap to clone and thread-safe; all mutation happens
//! inside the actor ([`crate::actor`]). A background watcher polls the
//! backend's liveness and, when the session dies, launches a replacement,
//! spawns a fresh actor over the same id source and observers, and
//! resubmits the last body so the document converges to the same state.

use std::sync::Arc;

use renga_types::IdSource;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::actor::{self, DocMsg};
use crate::backend::{CompletionReply, InspectReply, KernelBackend, KernelLauncher};
use crate::config::DocumentConfig;
use crate::connection::Connection;
use crate::error::DocError;

/// Per-session state the supervisor swaps out on restart.
struct Session {
    inbox: mpsc::UnboundedSender<DocMsg>,
    kernel: Arc<dyn KernelBackend>,
    /// Submission priority counter. Starts over with each session; the
    /// replacement actor starts with a zero applied priority, so the first
    /// submission after a restart always wins.
    prio: u64,
    /// Most recently submitted body, replayed after a restart.
    last_body: Option<String>,
}

struct Inner {
    id: String,
    launcher: Arc<dyn KernelLauncher>,
    connections: Arc<[Arc<dyn Connection>]>,
    config: DocumentConfig,
    ids: IdSource,
    session: RwLock<Session>,
    closed: CancellationToken,
}

/// Handle to a live document.
#[derive(Clone)]
pub struct Document {
    inner: Arc<Inner>,
}

impl Document {
    /// Launch a backend session and start the actor and supervisor for a
    /// new, empty document.
    pub async fn open(
        id: impl Into<String>,
        launcher: Arc<dyn KernelLauncher>,
        connections: Vec<Arc<dyn Connection>>,
        config: DocumentConfig,
    ) -> Result<Self, DocError> {
        let id = id.into();
        let ids = IdSource::new();
        let connections: Arc<[Arc<dyn Connection>]> = connections.into();

        let kernel = launcher.launch().await.map_err(DocError::Launch)?;
        let inbox = actor::spawn_actor(
            id.clone(),
            Arc::clone(&kernel),
            ids.clone(),
            Arc::clone(&connections),
            config.clone(),
        );

        let inner = Arc::new(Inner {
            id,
            launcher,
            connections,
            config,
            ids,
            session: RwLock::new(Session {
                inbox,
                kernel,
                prio: 0,
                last_body: None,
            }),
            closed: CancellationToken::new(),
        });

        tokio::spawn(watch(Arc::clone(&inner)));
        Ok(Self { inner })
    }

    /// Submit a new body. Later submissions carry higher priority and
    /// preempt earlier ones that have not finished.
    pub async fn submit(&self, body: &str) -> Result<(), DocError> {
        if self.inner.closed.is_cancelled() {
            return Err(DocError::Closed);
        }
        let mut session = self.inner.session.write().await;
        session.prio += 1;
        session.last_body = Some(body.to_owned());
        session
            .inbox
            .send(DocMsg::Submit {
                body: body.to_owned(),
                prio: session.prio,
            })
            .map_err(|_| DocError::Closed)
    }

    /// Request code completion at a byte cursor, in the live session's
    /// current state.
    pub async fn complete(&self, code: &str, cursor: usize) -> Result<CompletionReply, DocError> {
        let (tx, rx) = oneshot::channel();
        self.send(DocMsg::Complete {
            code: code.to_owned(),
            cursor,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| DocError::Closed)?.map_err(Into::into)
    }

    /// Request an object description at a byte cursor.
    pub async fn inspect(&self, code: &str, cursor: usize) -> Result<InspectReply, DocError> {
        let (tx, rx) = oneshot::channel();
        self.send(DocMsg::Inspect {
            code: code.to_owned(),
            cursor,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| DocError::Closed)?.map_err(Into::into)
    }

    /// Ask the actor to publish a snapshot even if nothing changed, e.g.
    /// for a newly attached observer.
    pub async fn request_broadcast(&self) -> Result<(), DocError> {
        self.send(DocMsg::Broadcast).await
    }

    /// Tear down the active actor and backend session without closing the
    /// document. The watcher notices the dead session, launches a
    /// replacement, and replays the last body — a fresh interpreter with
    /// the same document contents.
    pub async fn restart(&self) -> Result<(), DocError> {
        if self.inner.closed.is_cancelled() {
            return Err(DocError::Closed);
        }
        let session = self.inner.session.read().await;
        let _ = session.inbox.send(DocMsg::Shutdown);
        if let Err(e) = session.kernel.shutdown().await {
            tracing::debug!(document = %self.inner.id, error = %e, "kernel shutdown failed");
        }
        Ok(())
    }

    /// Stop the supervisor, the actor, and the backend session. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();
        let session = self.inner.session.read().await;
        let _ = session.inbox.send(DocMsg::Shutdown);
        if let Err(e) = session.kernel.shutdown().await {
            tracing::debug!(document = %self.inner.id, error = %e, "kernel shutdown failed");
        }
    }

    async fn send(&self, msg: DocMsg) -> Result<(), DocError> {
        if self.inner.closed.is_cancelled() {
            return Err(DocError::Closed);
        }
        let session = self.inner.session.read().await;
        session.inbox.send(msg).map_err(|_| DocError::Closed)
    }
}

/// Liveness watcher. Polls the current session; on death, launches a
/// replacement, swaps it in, and replays the last body.
async fn watch(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.liveness_poll());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.closed.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let alive = {
            let session = inner.session.read().await;
            session.kernel.is_alive().await
        };
        if alive {
            continue;
        }

        tracing::warn!(document = %inner.id, "kernel session died, restarting");
        let kernel = match inner.launcher.launch().await {
            Ok(k) => k,
            Err(e) => {
                // keep polling; the next tick tries again
                tracing::error!(document = %inner.id, error = %e, "kernel relaunch failed");
                continue;
            }
        };
        let inbox = actor::spawn_actor(
            inner.id.clone(),
            Arc::clone(&kernel),
            inner.ids.clone(),
            Arc::clone(&inner.connections),
            inner.config.clone(),
        );

        let mut session = inner.session.write().await;
        session.inbox = inbox;
        session.kernel = kernel;
        session.prio = 0;
        if let Some(body) = session.last_body.clone() {
            session.prio = 1;
            if session
                .inbox
                .send(DocMsg::Submit { body, prio: 1 })
                .is_err()
            {
                tracing::error!(document = %inner.id, "replacement actor rejected resubmission");
            }
        }
        tracing::info!(document = %inner.id, "kernel session restarted");
    }
}
