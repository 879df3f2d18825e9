//! In-process scripted backend.
//!
//! [`MockKernel`] implements [`KernelBackend`] over a tiny statement
//! language, enough to exercise every engine path without a real
//! interpreter process:
//!
//! ```text
//! print('hi')      stream output "hi\n" on stdout
//! x = 3            bind an integer variable (also `x += 2`)
//! x                evaluate a variable or literal, emit text/plain data
//! sleep 50         block for 50ms, interruptible
//! loop             block until interrupted
//! error Boom: msg  raise an error, aborting the rest of the statements
//! ```
//!
//! Statements are separated by newlines or `;`, `#` starts a comment.
//! Variables persist across execute calls within one instance and are
//! lost when the session is replaced, like a real interpreter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use renga_types::{MimeBundle, OutputPayload, TEXT_PLAIN};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::actor::INTERRUPT_ENAME;
use crate::backend::{
    CompletionReply, InspectReply, KernelBackend, KernelError, KernelEvent, KernelLauncher,
};

pub struct MockKernel {
    events: broadcast::Sender<KernelEvent>,
    vars: Mutex<HashMap<String, i64>>,
    cancel: Mutex<CancellationToken>,
    alive: AtomicBool,
}

impl MockKernel {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            events,
            vars: Mutex::new(HashMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
            alive: AtomicBool::new(true),
        }
    }

    /// Simulate a crash: liveness turns false without a shutdown call.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.cancel.lock().cancel();
    }

    pub fn var(&self, name: &str) -> Option<i64> {
        self.vars.lock().get(name).copied()
    }

    fn emit(&self, event: KernelEvent) {
        // nobody subscribed is fine
        let _ = self.events.send(event);
    }

    fn eval(&self, expr: &str) -> Result<i64, OutputPayload> {
        let expr = expr.trim();
        if let Ok(n) = expr.parse::<i64>() {
            return Ok(n);
        }
        match self.vars.lock().get(expr) {
            Some(n) => Ok(*n),
            None => Err(OutputPayload::Error {
                ename: "NameError".into(),
                evalue: format!("name '{expr}' is not defined"),
                traceback: vec![format!("NameError: name '{expr}' is not defined")],
            }),
        }
    }

    /// Run one statement. `Ok(true)` continues with the next statement,
    /// `Ok(false)` aborts the remainder of this execute call.
    async fn run_statement(&self, stmt: &str, cancel: &CancellationToken) -> bool {
        if let Some(inner) = stmt
            .strip_prefix("print(")
            .and_then(|s| s.strip_suffix(')'))
        {
            let text = inner.trim_matches(|c| c == '\'' || c == '"');
            self.emit(KernelEvent::Output(OutputPayload::Stream {
                name: "stdout".into(),
                text: format!("{text}\n"),
            }));
            return true;
        }

        if let Some(ms) = stmt.strip_prefix("sleep ") {
            let ms: u64 = ms.trim().parse().unwrap_or(0);
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => return true,
                _ = cancel.cancelled() => {
                    self.emit_interrupted();
                    return false;
                }
            }
        }

        if stmt == "loop" {
            cancel.cancelled().await;
            self.emit_interrupted();
            return false;
        }

        if let Some(rest) = stmt.strip_prefix("error ") {
            let (ename, evalue) = match rest.split_once(':') {
                Some((n, v)) => (n.trim().to_owned(), v.trim().to_owned()),
                None => (rest.trim().to_owned(), String::new()),
            };
            let traceback = vec![format!("{ename}: {evalue}")];
            self.emit(KernelEvent::Output(OutputPayload::Error {
                ename,
                evalue,
                traceback,
            }));
            return false;
        }

        if let Some((name, rhs)) = stmt.split_once("+=") {
            match self.eval(rhs) {
                Ok(n) => {
                    *self.vars.lock().entry(name.trim().to_owned()).or_insert(0) += n;
                    return true;
                }
                Err(err) => {
                    self.emit(KernelEvent::Output(err));
                    return false;
                }
            }
        }

        if let Some((name, rhs)) = stmt.split_once('=') {
            match self.eval(rhs) {
                Ok(n) => {
                    self.vars.lock().insert(name.trim().to_owned(), n);
                    return true;
                }
                Err(err) => {
                    self.emit(KernelEvent::Output(err));
                    return false;
                }
            }
        }

        // bare expression
        match self.eval(stmt) {
            Ok(n) => {
                let mut data = MimeBundle::new();
                data.insert(TEXT_PLAIN.into(), n.to_string());
                self.emit(KernelEvent::Output(OutputPayload::Data { data }));
                true
            }
            Err(err) => {
                self.emit(KernelEvent::Output(err));
                false
            }
        }
    }

    fn emit_interrupted(&self) {
        self.emit(KernelEvent::Output(OutputPayload::Error {
            ename: INTERRUPT_ENAME.into(),
            evalue: String::new(),
            traceback: Vec::new(),
        }));
    }

    /// The identifier ending at `cursor`, with its start offset. Code is
    /// opaque text, so the cursor may land inside a multibyte char; it is
    /// clamped back to the previous char boundary.
    fn word_at(code: &str, cursor: usize) -> (usize, &str) {
        let mut cursor = cursor.min(code.len());
        while cursor > 0 && !code.is_char_boundary(cursor) {
            cursor -= 1;
        }
        let head = &code[..cursor];
        let start = head
            .char_indices()
            .rev()
            .find(|(_, c)| !c.is_alphanumeric() && *c != '_')
            .map_or(0, |(i, c)| i + c.len_utf8());
        (start, &head[start..])
    }
}

#[async_trait]
impl KernelBackend for MockKernel {
    async fn execute(&self, code: &str) -> Result<(), KernelError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(KernelError::Dead);
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        self.emit(KernelEvent::Status { busy: true });
        for line in code.split('\n').flat_map(|l| l.split(';')) {
            let stmt = match line.split_once('#') {
                Some((head, _)) => head.trim(),
                None => line.trim(),
            };
            if stmt.is_empty() {
                continue;
            }
            if !self.run_statement(stmt, &cancel).await {
                break;
            }
        }
        self.emit(KernelEvent::Status { busy: false });
        self.emit(KernelEvent::ExecuteDone);
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), KernelError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(KernelError::Dead);
        }
        self.cancel.lock().cancel();
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn complete(&self, code: &str, cursor: usize) -> Result<CompletionReply, KernelError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(KernelError::Dead);
        }
        let (start, word) = Self::word_at(code, cursor);
        let mut matches: Vec<String> = self
            .vars
            .lock()
            .keys()
            .filter(|name| !word.is_empty() && name.starts_with(word))
            .cloned()
            .collect();
        matches.sort();
        Ok(CompletionReply {
            matches,
            cursor_start: start,
            cursor_end: start + word.len(),
        })
    }

    async fn inspect(&self, code: &str, cursor: usize) -> Result<InspectReply, KernelError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(KernelError::Dead);
        }
        let (_, word) = Self::word_at(code, cursor);
        let mut data = MimeBundle::new();
        let found = match self.vars.lock().get(word) {
            Some(n) => {
                data.insert(TEXT_PLAIN.into(), format!("{word} = {n}"));
                true
            }
            None => false,
        };
        Ok(InspectReply { found, data })
    }

    fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) -> Result<(), KernelError> {
        self.kill();
        Ok(())
    }
}

/// Launcher that hands out fresh [`MockKernel`] instances and keeps a
/// handle to each, so tests can kill a session and watch the supervisor
/// replace it.
pub struct MockLauncher {
    event_capacity: usize,
    created: Mutex<Vec<Arc<MockKernel>>>,
}

impl MockLauncher {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            event_capacity,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn latest(&self) -> Option<Arc<MockKernel>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl KernelLauncher for MockLauncher {
    async fn launch(&self) -> anyhow::Result<Arc<dyn KernelBackend>> {
        let kernel = Arc::new(MockKernel::new(self.event_capacity));
        self.created.lock().push(Arc::clone(&kernel));
        Ok(kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(rx: &mut broadcast::Receiver<KernelEvent>) -> Vec<KernelEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_print_emits_stream() {
        let kernel = MockKernel::new(16);
        let mut rx = kernel.subscribe();
        kernel.execute("print('hi')").await.unwrap();
        let events = drain(&mut rx).await;
        assert!(matches!(events[0], KernelEvent::Status { busy: true }));
        match &events[1] {
            KernelEvent::Output(OutputPayload::Stream { name, text }) => {
                assert_eq!(name, "stdout");
                assert_eq!(text, "hi\n");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(events[2], KernelEvent::Status { busy: false }));
        assert!(matches!(events[3], KernelEvent::ExecuteDone));
    }

    #[tokio::test]
    async fn test_vars_persist_across_executes() {
        let kernel = MockKernel::new(16);
        let _rx = kernel.subscribe();
        kernel.execute("x = 3").await.unwrap();
        kernel.execute("x += 2").await.unwrap();
        assert_eq!(kernel.var("x"), Some(5));
    }

    #[tokio::test]
    async fn test_bare_expression_emits_data() {
        let kernel = MockKernel::new(16);
        let mut rx = kernel.subscribe();
        kernel.execute("x = 7; x").await.unwrap();
        let data = drain(&mut rx)
            .await
            .into_iter()
            .find_map(|ev| match ev {
                KernelEvent::Output(OutputPayload::Data { data }) => Some(data),
                _ => None,
            })
            .unwrap();
        assert_eq!(data.get(TEXT_PLAIN).map(String::as_str), Some("7"));
    }

    #[tokio::test]
    async fn test_error_aborts_remaining_statements() {
        let kernel = MockKernel::new(16);
        let mut rx = kernel.subscribe();
        kernel.execute("error Boom: bad\nprint('after')").await.unwrap();
        let events = drain(&mut rx).await;
        let streams = events
            .iter()
            .filter(|ev| matches!(ev, KernelEvent::Output(OutputPayload::Stream { .. })))
            .count();
        assert_eq!(streams, 0);
        assert!(events.iter().any(|ev| matches!(
            ev,
            KernelEvent::Output(OutputPayload::Error { ename, .. }) if ename == "Boom"
        )));
    }

    #[tokio::test]
    async fn test_undefined_name_errors() {
        let kernel = MockKernel::new(16);
        let mut rx = kernel.subscribe();
        kernel.execute("nope").await.unwrap();
        assert!(drain(&mut rx).await.iter().any(|ev| matches!(
            ev,
            KernelEvent::Output(OutputPayload::Error { ename, .. }) if ename == "NameError"
        )));
    }

    #[tokio::test]
    async fn test_interrupt_unblocks_loop() {
        let kernel = Arc::new(MockKernel::new(16));
        let mut rx = kernel.subscribe();
        let exec = {
            let kernel = Arc::clone(&kernel);
            tokio::spawn(async move { kernel.execute("loop").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        kernel.interrupt().await.unwrap();
        exec.await.unwrap().unwrap();
        assert!(drain(&mut rx).await.iter().any(|ev| matches!(
            ev,
            KernelEvent::Output(OutputPayload::Error { ename, .. }) if ename == INTERRUPT_ENAME
        )));
    }

    #[tokio::test]
    async fn test_comments_are_stripped() {
        let kernel = MockKernel::new(16);
        let _rx = kernel.subscribe();
        kernel.execute("x = 1 # set it\n# whole line").await.unwrap();
        assert_eq!(kernel.var("x"), Some(1));
    }

    #[tokio::test]
    async fn test_killed_kernel_rejects_execute() {
        let kernel = MockKernel::new(16);
        kernel.kill();
        assert!(!kernel.is_alive().await);
        assert!(matches!(
            kernel.execute("x = 1").await,
            Err(KernelError::Dead)
        ));
    }

    #[tokio::test]
    async fn test_complete_matches_vars() {
        let kernel = MockKernel::new(16);
        kernel.execute("alpha = 1; alpine = 2; beta = 3").await.unwrap();
        let reply = kernel.complete("print(alp", 9).await.unwrap();
        assert_eq!(reply.matches, vec!["alpha", "alpine"]);
        assert_eq!(reply.cursor_start, 6);
        assert_eq!(reply.cursor_end, 9);
    }

    #[tokio::test]
    async fn test_introspection_survives_multibyte_text() {
        let kernel = MockKernel::new(16);
        kernel.execute("b = 1").await.unwrap();

        // cursor inside a two-byte char clamps back to the boundary
        let reply = kernel.complete("é", 1).await.unwrap();
        assert!(reply.matches.is_empty());
        assert_eq!(reply.cursor_start, 0);
        assert_eq!(reply.cursor_end, 0);

        // multibyte separator directly before the word
        let reply = kernel.complete("a→b", 5).await.unwrap();
        assert_eq!(reply.matches, vec!["b"]);
        assert_eq!(reply.cursor_start, 4);
        assert_eq!(reply.cursor_end, 5);

        assert!(!kernel.inspect("é", 1).await.unwrap().found);
    }

    #[tokio::test]
    async fn test_inspect_found_and_missing() {
        let kernel = MockKernel::new(16);
        kernel.execute("x = 42").await.unwrap();
        let reply = kernel.inspect("x", 1).await.unwrap();
        assert!(reply.found);
        assert_eq!(reply.data.get(TEXT_PLAIN).map(String::as_str), Some("x = 42"));
        assert!(!kernel.inspect("y", 1).await.unwrap().found);
    }

    #[tokio::test]
    async fn test_launcher_tracks_instances() {
        let launcher = MockLauncher::new(16);
        let _a = launcher.launch().await.unwrap();
        let _b = launcher.launch().await.unwrap();
        assert_eq!(launcher.launch_count(), 2);
        assert!(launcher.latest().is_some());
    }
}
