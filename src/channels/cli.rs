use super::traits::{Connection, Destination, DestinationHandle, Event, Scope};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Input = Box<dyn AsyncBufRead + Send + Unpin>;

/// Console connection over stdin/stdout, for running the bot locally.
///
/// A line `#dest text` is a public event in `#dest`; any other line is a
/// private event from the operator.
pub struct CliConnection {
    nick: String,
    operator: String,
    input: Mutex<Option<Input>>,
    joined: Mutex<BTreeSet<String>>,
    quit: CancellationToken,
    seq: AtomicU64,
}

impl CliConnection {
    pub fn new(nick: impl Into<String>) -> Self {
        Self::with_input(nick, Box::new(BufReader::new(io::stdin())))
    }

    pub fn with_input(nick: impl Into<String>, input: Input) -> Self {
        Self {
            nick: nick.into(),
            operator: "operator!operator@console".into(),
            input: Mutex::new(Some(input)),
            joined: Mutex::new(BTreeSet::new()),
            quit: CancellationToken::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn joined(&self) -> Vec<String> {
        self.joined.lock().iter().cloned().collect()
    }

    fn parse_line(&self, line: &str) -> Event {
        let sender = self
            .operator
            .split_once('!')
            .map_or(self.operator.as_str(), |(nick, _)| nick)
            .to_string();

        let (destination, text) = match line.split_once(' ') {
            Some((dest, rest)) if dest.starts_with('#') && !rest.trim().is_empty() => {
                (Destination::Public(dest.to_string()), rest.trim())
            }
            _ => (Destination::Private, line),
        };

        Event {
            id: self.seq.fetch_add(1, Ordering::Relaxed),
            sender,
            prefix: self.operator.clone(),
            lines: vec![text.to_string()],
            destination,
        }
    }
}

#[async_trait]
impl Connection for CliConnection {
    fn name(&self) -> &str {
        "cli"
    }

    async fn listen(&self, tx: mpsc::Sender<Event>) -> anyhow::Result<()> {
        let input = self
            .input
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("console input already consumed"))?;
        let mut lines = input.lines();
        tracing::info!(nick = %self.nick, "console connection ready");

        loop {
            let line = tokio::select! {
                () = self.quit.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "/quit" || line == "/exit" {
                break;
            }

            if tx.send(self.parse_line(line)).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn reply(&self, _scope: &Scope, event: &Event, lines: &[String]) -> anyhow::Result<()> {
        for line in lines {
            println!("[{}] <{}> {line}", event.reply_target(), self.nick);
        }
        Ok(())
    }

    async fn announce(&self, destination: &DestinationHandle, text: &str) -> anyhow::Result<()> {
        println!("[{}] <{}> {text}", destination.name(), self.nick);
        Ok(())
    }

    async fn join(&self, _scope: &Scope, name: &str) -> anyhow::Result<DestinationHandle> {
        if !name.starts_with('#') {
            anyhow::bail!("not a public destination: {name}");
        }
        self.joined.lock().insert(name.to_string());
        Ok(DestinationHandle::new(name))
    }

    async fn quit(&self, reason: &str) {
        if !self.quit.is_cancelled() {
            println!("* {} quit ({reason})", self.nick);
        }
        self.quit.cancel();
    }
}
