//! Redelivery outbox: the handler the CLI registers for retries.
//!
//! Each re-delivered record becomes one JSON line on the outbox, where the
//! downstream consumer picks it up.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde_json::json;

use uno_events::{DeadLetterHandler, DeadLetterRecord};

pub struct OutboxHandler {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl OutboxHandler {
    pub fn stdout() -> Self {
        Self::from_writer(io::stdout())
    }

    /// Append to `path`, creating it if needed.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open outbox {}", path.display()))?;
        Ok(Self::from_writer(file))
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }
}

/// The line written for `record`.
pub fn outbox_line(record: &DeadLetterRecord) -> serde_json::Value {
    json!({
        "id": record.id(),
        "subscription_id": record.subscription_id(),
        "reason": record.reason(),
        "attempt_count": record.attempt_count(),
        "event": record.event_data(),
    })
}

#[async_trait]
impl DeadLetterHandler for OutboxHandler {
    async fn handle(&self, record: &DeadLetterRecord) -> anyhow::Result<()> {
        let line = serde_json::to_string(&outbox_line(record))?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("outbox writer poisoned"))?;
        writeln!(writer, "{line}").context("cannot write to outbox")?;
        writer.flush().context("cannot flush outbox")?;
        Ok(())
    }
}
