//! The per-document actor.
//!
//! One tokio task owns one backend session and one strictly-ordered inbox.
//! Edits, backend output, introspection requests, and completion notices
//! all arrive as [`DocMsg`] values; only this task mutates document state,
//! so handling is atomic with respect to other messages of the same
//! document. Dispatch, the interrupt retry, and the event pump are
//! independent tasks that communicate back through the inbox — they never
//! touch state directly.
//!
//! ```text
//!   Document handle ──┐
//!   event pump ───────┼──▶ inbox ──▶ handle ──▶ cascade? ──▶ apply ──▶ broadcast?
//!   dispatch task ────┤              (one message at a time)
//!   retry task ───────┘
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use renga_types::{Block, BlockStatus, DocumentSnapshot, IdSource, OutputEvent, OutputPayload};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::backend::{CompletionReply, InspectReply, KernelBackend, KernelError, KernelEvent};
use crate::config::DocumentConfig;
use crate::connection::Connection;
use crate::diff;

/// Error name the backend raises for an explicit interruption. Such
/// errors are acknowledgements of preemption, not block output: they are
/// neither recorded nor treated as an execution failure.
pub(crate) const INTERRUPT_ENAME: &str = "KeyboardInterrupt";

/// An edit that wants to replace the currently applied body.
#[derive(Clone, Debug)]
struct PreemptionRequest {
    prio: u64,
    body: String,
}

/// Inbox message for a document actor.
pub(crate) enum DocMsg {
    /// A new body submission with its priority (the interrupt/edit message).
    Submit { body: String, prio: u64 },
    /// Forward a completion request to the backend.
    Complete {
        code: String,
        cursor: usize,
        reply: oneshot::Sender<Result<CompletionReply, KernelError>>,
    },
    /// Forward an inspection request to the backend.
    Inspect {
        code: String,
        cursor: usize,
        reply: oneshot::Sender<Result<InspectReply, KernelError>>,
    },
    /// An event pumped from the backend's output stream.
    Kernel(KernelEvent),
    /// The current execute call ended. Normally carried in-stream as
    /// [`KernelEvent::ExecuteDone`]; the dispatch task injects one when the
    /// execute call itself failed and the stream stayed silent.
    ExecuteDone,
    /// The event pump fell behind and dropped `missed` kernel events. The
    /// completion marker may have been among them.
    Lagged { missed: u64 },
    /// Publish a snapshot even if nothing changed.
    Broadcast,
    /// Stop the actor.
    Shutdown,
}

/// What the current inbox message did, gathered across handle/cascade/apply.
#[derive(Default)]
struct Tick {
    broadcast: bool,
    cancel_queue: bool,
    /// The cascade was triggered by an execution error: the errored block
    /// keeps its output and lands in `done`, not `cancelled`.
    error_abort: bool,
}

pub(crate) struct DocumentActor {
    document_id: String,
    kernel: Arc<dyn KernelBackend>,
    ids: IdSource,
    connections: Arc<[Arc<dyn Connection>]>,
    config: DocumentConfig,
    /// Clone of our own inbox sender, handed to feeder tasks.
    inbox: mpsc::UnboundedSender<DocMsg>,

    // Block lists: `done ++ [now] ++ scheduled` always matches the block
    // ordering of the most recently applied body.
    done: Vec<Block>,
    now: Option<Block>,
    scheduled: VecDeque<Block>,

    running: bool,
    busy: bool,
    finished: Option<u64>,
    /// Priority of the currently applied body; monotonically non-decreasing.
    body_prio: u64,
    /// Body adopted but not yet applied through the differ.
    pending_body: Option<String>,
    /// Edit waiting for the in-flight execution to end.
    interrupting: Option<PreemptionRequest>,
}

/// Spawn an actor plus its event pump; returns the inbox sender.
///
/// The event subscription is taken here, before the actor could possibly
/// dispatch its first execute, so no early output is lost.
pub(crate) fn spawn_actor(
    document_id: String,
    kernel: Arc<dyn KernelBackend>,
    ids: IdSource,
    connections: Arc<[Arc<dyn Connection>]>,
    config: DocumentConfig,
) -> mpsc::UnboundedSender<DocMsg> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut events = kernel.subscribe();
    let pump_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) => {
                    if pump_tx.send(DocMsg::Kernel(ev)).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    if pump_tx.send(DocMsg::Lagged { missed }).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let actor = DocumentActor {
        document_id,
        kernel,
        ids,
        connections,
        config,
        inbox: tx.clone(),
        done: Vec::new(),
        now: None,
        scheduled: VecDeque::new(),
        running: false,
        busy: false,
        finished: None,
        body_prio: 0,
        pending_body: None,
        interrupting: None,
    };
    tokio::spawn(actor.run(rx));

    tx
}

impl DocumentActor {
    /// Process messages until shutdown or backend death.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DocMsg>) {
        while let Some(msg) = rx.recv().await {
            if matches!(msg, DocMsg::Shutdown) {
                tracing::debug!(document = %self.document_id, "actor shutting down");
                return;
            }
            if !self.kernel.is_alive().await {
                tracing::warn!(document = %self.document_id, "kernel died, actor exiting");
                return;
            }

            let mut tick = Tick::default();
            self.handle(msg, &mut tick).await;

            if tick.cancel_queue {
                self.cancel_cascade(tick.error_abort);
                tick.broadcast = true;
            }
            if !self.running {
                self.apply(&mut tick);
            }
            if tick.broadcast {
                self.broadcast().await;
            }
        }
    }

    async fn handle(&mut self, msg: DocMsg, tick: &mut Tick) {
        match msg {
            DocMsg::Submit { body, prio } => self.handle_submit(body, prio).await,
            DocMsg::Complete { code, cursor, reply } => {
                let _ = reply.send(self.kernel.complete(&code, cursor).await);
            }
            DocMsg::Inspect { code, cursor, reply } => {
                let _ = reply.send(self.kernel.inspect(&code, cursor).await);
            }
            DocMsg::Kernel(KernelEvent::Status { busy }) => {
                if self.busy != busy {
                    self.busy = busy;
                    tick.broadcast = true;
                }
            }
            DocMsg::Kernel(KernelEvent::Output(payload)) => {
                self.handle_output(payload, tick);
            }
            DocMsg::Kernel(KernelEvent::ExecuteDone) | DocMsg::ExecuteDone => {
                self.handle_execute_done(tick);
            }
            DocMsg::Lagged { missed } => self.handle_lagged(missed, tick),
            DocMsg::Broadcast => tick.broadcast = true,
            DocMsg::Shutdown => unreachable!("handled in run"),
        }
    }

    /// An edit. Applied now if nothing runs, or parked as the pending
    /// preemption and pushed at the backend via interrupt.
    async fn handle_submit(&mut self, body: String, prio: u64) {
        // a strictly newer preemption is already pending; equal priority
        // passes so the interrupt retry can re-enter
        if self.interrupting.as_ref().is_some_and(|p| prio < p.prio) {
            return;
        }
        if !self.running && prio > self.body_prio {
            self.body_prio = prio;
            self.pending_body = Some(body);
        } else if self.running && prio > self.body_prio {
            self.interrupting = Some(PreemptionRequest {
                prio,
                body: body.clone(),
            });
            if self.busy {
                // optimistic: assume the signal lands; the backend reports
                // completion through the event stream either way
                self.busy = false;
                if let Err(e) = self.kernel.interrupt().await {
                    tracing::warn!(document = %self.document_id, error = %e, "interrupt failed");
                }
            } else {
                // The backend has not reported busy yet: the edit raced
                // ahead of the execution start. Re-evaluate after a delay.
                tracing::debug!(document = %self.document_id, prio, "too early to interrupt, requeueing");
                let inbox = self.inbox.clone();
                let delay = self.config.interrupt_retry();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inbox.send(DocMsg::Submit { body, prio });
                });
            }
        }
    }

    /// The in-flight execution ended: record which block finished, settle
    /// the running flag, and promote a pending preemption if it still
    /// outranks the applied body.
    fn handle_execute_done(&mut self, tick: &mut Tick) {
        if let Some(now) = &self.now {
            self.finished = Some(now.id);
        }
        self.running = false;
        // running flipped: observers get a settled snapshot even when no
        // block-list step fires afterwards
        tick.broadcast = true;
        if self.interrupting.as_ref().is_some_and(|p| p.prio > self.body_prio) {
            if let Some(p) = self.interrupting.take() {
                self.body_prio = p.prio;
                self.pending_body = Some(p.body);
                tick.cancel_queue = true;
            }
        }
    }

    /// Kernel events were dropped on the floor. The completion marker may
    /// have been among them, which would leave the document running
    /// forever, so settle the in-flight execution and record the loss in
    /// the block's output. A marker that was not actually lost arrives
    /// later and re-runs the (idempotent) completion path.
    fn handle_lagged(&mut self, missed: u64, tick: &mut Tick) {
        tracing::warn!(document = %self.document_id, missed, "kernel event stream lagged");
        if !self.running {
            return;
        }
        if let Some(now) = self.now.as_mut() {
            now.msgs.push(OutputEvent::new(
                self.ids.next_id(),
                OutputPayload::Stream {
                    name: "stderr".into(),
                    text: format!("[{missed} kernel events dropped]\n"),
                },
            ));
        }
        self.handle_execute_done(tick);
    }

    /// Backend output for the currently executing block.
    fn handle_output(&mut self, payload: OutputPayload, tick: &mut Tick) {
        if !self.running {
            tracing::warn!(document = %self.document_id, ?payload, "output with no execution in flight");
        }
        let interrupted =
            matches!(&payload, OutputPayload::Error { ename, .. } if ename == INTERRUPT_ENAME);
        if interrupted {
            // acknowledgement of preemption, not block output
            return;
        }
        let is_error = payload.is_error();
        match self.now.as_mut() {
            Some(now) => now.msgs.push(OutputEvent::new(self.ids.next_id(), payload)),
            None => {
                tracing::warn!(document = %self.document_id, "detached output event, ignoring");
            }
        }
        if is_error {
            // an error aborts the remainder of the current body
            tick.cancel_queue = true;
            tick.error_abort = true;
        }
    }

    /// Convert the current and all still-scheduled blocks to their final
    /// states and append them to `done`, preserving document order.
    fn cancel_cascade(&mut self, error_abort: bool) {
        if let Some(mut now) = self.now.take() {
            if error_abort {
                // the errored block is complete with its error output intact
                now.status = BlockStatus::Done;
                self.finished = Some(now.id);
                self.done.push(now);
            } else {
                self.done.push(now.into_cancelled());
            }
        }
        for block in self.scheduled.drain(..) {
            self.done.push(block.into_cancelled());
        }
    }

    /// The fixed three-step apply order: pending body, completed block,
    /// dispatch. Runs once per processed message, only while idle.
    fn apply(&mut self, tick: &mut Tick) {
        if let Some(body) = self.pending_body.take() {
            let part = diff::diff(&body, &self.done, &self.ids);
            self.done = part.done;
            self.scheduled = part.scheduled;
            self.now = None;
            tick.broadcast = true;
        }

        if let Some(mut now) = self.now.take() {
            now.status = BlockStatus::Done;
            self.done.push(now);
            tick.broadcast = true;
        }

        if let Some(mut block) = self.scheduled.pop_front() {
            block.status = BlockStatus::Executing;
            block.msgs.clear();
            tracing::debug!(document = %self.document_id, block = block.id, "dispatching block");

            let kernel = Arc::clone(&self.kernel);
            let code = block.code.clone();
            let inbox = self.inbox.clone();
            tokio::spawn(async move {
                if let Err(e) = kernel.execute(&code).await {
                    // the stream never got its terminator; inject one so
                    // the document settles
                    tracing::warn!(error = %e, "execute call failed");
                    let _ = inbox.send(DocMsg::ExecuteDone);
                }
            });

            self.now = Some(block);
            self.running = true;
            tick.broadcast = true;
        }
    }

    fn snapshot(&self) -> DocumentSnapshot {
        let mut all = self.done.clone();
        all.extend(self.now.clone());
        all.extend(self.scheduled.iter().cloned());
        DocumentSnapshot {
            all,
            running: self.running,
            busy: self.busy,
            body_prio: self.body_prio,
            finished: self.finished,
        }
    }

    /// Deliver the snapshot to every observer, sequentially, in the order
    /// produced. The loop does not pull the next message until delivery
    /// finishes, so observers see changes in order.
    async fn broadcast(&self) {
        let snapshot = self.snapshot();
        for connection in self.connections.iter() {
            connection.notify(&self.document_id, snapshot.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::mock::MockKernel;

    use super::*;

    fn bare_actor() -> (DocumentActor, mpsc::UnboundedReceiver<DocMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = DocumentActor {
            document_id: "doc".into(),
            kernel: Arc::new(MockKernel::new(16)),
            ids: IdSource::new(),
            connections: Arc::from(Vec::<Arc<dyn Connection>>::new()),
            config: DocumentConfig::default(),
            inbox: tx,
            done: Vec::new(),
            now: None,
            scheduled: VecDeque::new(),
            running: false,
            busy: false,
            finished: None,
            body_prio: 0,
            pending_body: None,
            interrupting: None,
        };
        (actor, rx)
    }

    #[tokio::test]
    async fn test_lagged_stream_settles_inflight_execution() {
        let (mut actor, _rx) = bare_actor();
        let block = Block::new(actor.ids.next_id(), "x", BlockStatus::Executing);
        let block_id = block.id;
        actor.now = Some(block);
        actor.running = true;

        let mut tick = Tick::default();
        actor.handle(DocMsg::Lagged { missed: 3 }, &mut tick).await;

        assert!(!actor.running);
        assert!(tick.broadcast);
        assert_eq!(actor.finished, Some(block_id));
        let text = actor.now.as_ref().unwrap().msgs[0]
            .payload
            .text_plain()
            .unwrap();
        assert!(text.contains("3 kernel events dropped"));
    }

    #[tokio::test]
    async fn test_lagged_stream_while_idle_changes_nothing() {
        let (mut actor, _rx) = bare_actor();
        let mut tick = Tick::default();
        actor.handle(DocMsg::Lagged { missed: 1 }, &mut tick).await;
        assert!(!actor.running);
        assert!(actor.now.is_none());
        assert!(actor.finished.is_none());
        assert!(!tick.broadcast);
    }

    #[tokio::test]
    async fn test_duplicate_completion_marker_is_idempotent() {
        let (mut actor, _rx) = bare_actor();
        let block = Block::new(actor.ids.next_id(), "x", BlockStatus::Executing);
        let block_id = block.id;
        actor.now = Some(block);
        actor.running = true;

        let mut tick = Tick::default();
        actor.handle(DocMsg::ExecuteDone, &mut tick).await;
        actor.handle(DocMsg::ExecuteDone, &mut tick).await;

        assert!(!actor.running);
        assert_eq!(actor.finished, Some(block_id));
        assert!(actor.interrupting.is_none());
    }
}
