use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where an event was said.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Named public conversation, e.g. `#mania`
    Public(String),
    /// One-to-one exchange with the sender
    Private,
}

/// One inbound chat message.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: u64,
    /// Sender nickname
    pub sender: String,
    /// Full sender mask, `nick!user@host`
    pub prefix: String,
    pub lines: Vec<String>,
    pub destination: Destination,
}

impl Event {
    pub fn is_private(&self) -> bool {
        self.destination == Destination::Private
    }

    pub fn destination_name(&self) -> Option<&str> {
        match self.destination {
            Destination::Public(ref name) => Some(name),
            Destination::Private => None,
        }
    }

    /// Public events are answered in their destination, private ones to the sender.
    pub fn reply_target(&self) -> &str {
        self.destination_name().unwrap_or(&self.sender)
    }

    pub fn first_line(&self) -> &str {
        self.lines.first().map_or("", String::as_str)
    }

    pub fn text(&self) -> String {
        self.lines.join(" ")
    }
}

/// Handle to a joined public destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationHandle {
    name: String,
}

impl DestinationHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    TimedOut,
}

/// Cancellation scope of one unit of work: a child of the runtime's shutdown
/// token plus an absolute deadline.
#[derive(Debug, Clone)]
pub struct Scope {
    token: CancellationToken,
    deadline: Instant,
}

impl Scope {
    pub fn new(parent: &CancellationToken, timeout: Duration) -> Self {
        Self {
            token: parent.child_token(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Drive `fut` until it completes, the deadline passes, or the scope is cancelled.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ScopeError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(ScopeError::Cancelled),
            result = tokio::time::timeout_at(self.deadline, fut) => {
                result.map_err(|_| ScopeError::TimedOut)
            }
        }
    }
}

/// Chat protocol connection consumed by the runtime.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Human-readable connection name
    fn name(&self) -> &str;

    /// Deliver inbound events until the connection terminates. The returned
    /// value is the connection's terminal outcome.
    async fn listen(&self, tx: mpsc::Sender<Event>) -> anyhow::Result<()>;

    /// Answer `event` where it was said.
    async fn reply(&self, scope: &Scope, event: &Event, lines: &[String]) -> anyhow::Result<()>;

    /// Unsolicited message to a joined destination.
    async fn announce(&self, destination: &DestinationHandle, text: &str) -> anyhow::Result<()>;

    async fn join(&self, scope: &Scope, name: &str) -> anyhow::Result<DestinationHandle>;

    /// Leave the network; `listen` returns afterwards.
    async fn quit(&self, reason: &str);
}
