/*!
Stubs du canal push

- `RecordingPushSink` : côté serveur, enregistre chaque frame émis et sa cible
- `FailingPushSink` : côté serveur, canal indisponible
- `MockPushTransport` : côté client, chaque `open()` crée une connexion que le
  test pilote (frames entrants, commandes reçues, coupure)
*/

use futures_util::future::BoxFuture;
use gasmon_common::{ClientCommand, PushConnection, PushError, PushSink, PushTransport, ServerFrame, Target};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct RecordingPushSink {
    frames: Mutex<Vec<(Target, ServerFrame)>>,
}

impl RecordingPushSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<(Target, ServerFrame)> {
        self.frames.lock().clone()
    }

    pub fn frames_named(&self, event: &str) -> Vec<(Target, ServerFrame)> {
        self.frames.lock().iter().filter(|(_, f)| f.event == event).cloned().collect()
    }

    pub fn frames_for(&self, target: &Target) -> Vec<ServerFrame> {
        self.frames
            .lock()
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, f)| f.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

impl PushSink for RecordingPushSink {
    fn emit(&self, target: &Target, frame: &ServerFrame) -> Result<usize, PushError> {
        log::debug!("📡 [MOCK] emit {} -> {}", frame.event, target);
        self.frames.lock().push((target.clone(), frame.clone()));
        Ok(1)
    }
}

pub struct FailingPushSink;

impl PushSink for FailingPushSink {
    fn emit(&self, _target: &Target, _frame: &ServerFrame) -> Result<usize, PushError> {
        Err(PushError::Unavailable("mock push channel down".into()))
    }
}

/// Côté serveur d'une connexion ouverte par le client testé
pub struct MockConnection {
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    frames: mpsc::UnboundedSender<ServerFrame>,
}

impl MockConnection {
    /// Pousse un frame vers le client
    pub fn push(&self, event: &str, data: Value) -> bool {
        self.frames.send(ServerFrame::new(event, data)).is_ok()
    }

    /// Commandes déjà reçues, sans attendre
    pub fn drain_commands(&mut self) -> Vec<ClientCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.commands.try_recv() {
            out.push(cmd);
        }
        out
    }

    pub async fn next_command(&mut self, wait: Duration) -> Option<ClientCommand> {
        tokio::time::timeout(wait, self.commands.recv()).await.ok().flatten()
    }

    /// Coupe la connexion : le flux entrant du client se termine
    pub fn drop_connection(self) {
        log::info!("🔌 [MOCK] connection dropped by server");
    }
}

pub struct MockPushTransport {
    opened: AtomicUsize,
    failures_left: AtomicUsize,
    accepted_tx: mpsc::UnboundedSender<MockConnection>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockConnection>>,
}

impl MockPushTransport {
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            opened: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
        }
    }

    /// Les `n` prochaines ouvertures échouent
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Attend la prochaine connexion ouverte par le client
    pub async fn accept(&self, wait: Duration) -> Option<MockConnection> {
        let mut rx = self.accepted_rx.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }
}

impl Default for MockPushTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PushTransport for MockPushTransport {
    fn open(&self) -> BoxFuture<'_, Result<PushConnection, PushError>> {
        Box::pin(async move {
            let should_fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                log::info!("🔌 [MOCK] connection refused");
                return Err(PushError::Connect("mock refused".into()));
            }

            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (frame_tx, frame_rx) = mpsc::unbounded_channel();
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.accepted_tx
                .send(MockConnection { commands: cmd_rx, frames: frame_tx })
                .map_err(|_| PushError::Unavailable("mock transport closed".into()))?;
            log::info!("🔌 [MOCK] connection opened");
            Ok(PushConnection { outbound: cmd_tx, inbound: frame_rx })
        })
    }
}
