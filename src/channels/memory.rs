use super::traits::{Connection, Destination, DestinationHandle, Event, Scope};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Something the bot sent out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Reply { target: String, lines: Vec<String> },
    Announce { destination: String, text: String },
}

/// Loopback connection: events are injected in-process and everything the
/// bot sends is recorded. Used for embedding and tests.
pub struct MemoryConnection {
    injector: mpsc::Sender<Event>,
    inbound: Mutex<Option<mpsc::Receiver<Event>>>,
    sent: Mutex<Vec<Outbound>>,
    joined: Mutex<Vec<String>>,
    quit_reason: Mutex<Option<String>>,
    closed: CancellationToken,
    seq: AtomicU64,
}

impl MemoryConnection {
    pub fn new() -> Self {
        let (injector, inbound) = mpsc::channel(64);
        Self {
            injector,
            inbound: Mutex::new(Some(inbound)),
            sent: Mutex::new(Vec::new()),
            joined: Mutex::new(Vec::new()),
            quit_reason: Mutex::new(None),
            closed: CancellationToken::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Build an event from `prefix` (`nick!user@host`).
    pub fn event(&self, prefix: &str, destination: Destination, text: &str) -> Event {
        let sender = prefix.split_once('!').map_or(prefix, |(nick, _)| nick);
        Event {
            id: self.seq.fetch_add(1, Ordering::Relaxed),
            sender: sender.to_string(),
            prefix: prefix.to_string(),
            lines: text.lines().map(str::to_string).collect(),
            destination,
        }
    }

    pub fn public(&self, destination: &str, prefix: &str, text: &str) -> Event {
        self.event(prefix, Destination::Public(destination.to_string()), text)
    }

    pub fn private(&self, prefix: &str, text: &str) -> Event {
        self.event(prefix, Destination::Private, text)
    }

    /// Queue `event` for `listen`. `false` if the connection is gone or full.
    pub fn inject(&self, event: Event) -> bool {
        self.injector.try_send(event).is_ok()
    }

    /// End `listen` as if the peer disconnected.
    pub fn hang_up(&self) {
        self.closed.cancel();
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().clone()
    }

    pub fn replies(&self) -> Vec<(String, Vec<String>)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|out| match out {
                Outbound::Reply { target, lines } => Some((target.clone(), lines.clone())),
                Outbound::Announce { .. } => None,
            })
            .collect()
    }

    pub fn announcements(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|out| match out {
                Outbound::Announce { destination, text } => {
                    Some((destination.clone(), text.clone()))
                }
                Outbound::Reply { .. } => None,
            })
            .collect()
    }

    pub fn joined(&self) -> Vec<String> {
        self.joined.lock().clone()
    }

    pub fn quit_reason(&self) -> Option<String> {
        self.quit_reason.lock().clone()
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        "memory"
    }

    async fn listen(&self, tx: mpsc::Sender<Event>) -> anyhow::Result<()> {
        let mut inbound = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("memory connection already listening"))?;

        loop {
            let event = tokio::select! {
                () = self.closed.cancelled() => break,
                event = inbound.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn reply(&self, _scope: &Scope, event: &Event, lines: &[String]) -> anyhow::Result<()> {
        if self.closed.is_cancelled() {
            anyhow::bail!("connection closed");
        }
        self.sent.lock().push(Outbound::Reply {
            target: event.reply_target().to_string(),
            lines: lines.to_vec(),
        });
        Ok(())
    }

    async fn announce(&self, destination: &DestinationHandle, text: &str) -> anyhow::Result<()> {
        if self.closed.is_cancelled() {
            anyhow::bail!("connection closed");
        }
        self.sent.lock().push(Outbound::Announce {
            destination: destination.name().to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn join(&self, _scope: &Scope, name: &str) -> anyhow::Result<DestinationHandle> {
        self.joined.lock().push(name.to_string());
        Ok(DestinationHandle::new(name))
    }

    async fn quit(&self, reason: &str) {
        self.quit_reason.lock().get_or_insert_with(|| reason.to_string());
        self.closed.cancel();
    }
}
