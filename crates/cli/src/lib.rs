//! `uno-dlq` operator CLI.
//!
//! Inspects and drives a dead letter snapshot file: list, show, retry,
//! replay, clear, run a sweep and print statistics. Re-delivered events are
//! written as JSON lines to the outbox.

pub mod outbox;

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::debug;

use uno_core::id::ParseRecordIdError;
use uno_core::{DlqError, RecordId};
use uno_events::{DeadLetterReason, DeadLetterRecord};
use uno_infra::dlq::{
    DeadLetterQueue, DlqConfig, FileDeadLetterStore, RecordFilter, RetryOutcome, SkipReason,
};

use outbox::OutboxHandler;

/// Dead letter queue administration CLI.
#[derive(Debug, Parser)]
#[command(name = "uno-dlq")]
#[command(about = "Inspect and re-deliver dead-lettered events", long_about = None)]
pub struct Cli {
    /// Dead letter snapshot file.
    #[arg(long, env = "UNO_DLQ_STATE", default_value = "dead_letters.json")]
    pub state: PathBuf,

    /// Where re-delivered events are appended (stdout when unset).
    #[arg(long, env = "UNO_DLQ_OUTBOX")]
    pub outbox: Option<PathBuf>,

    /// Default log filter when RUST_LOG is not set.
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List dead letters, oldest first.
    List {
        /// Maximum number of records to show.
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only records with this reason (e.g. HANDLER_FAILED, timeout).
        #[arg(short, long)]
        reason: Option<DeadLetterReason>,
    },

    /// Print one dead letter as JSON.
    Show {
        /// Record id.
        id: String,
    },

    /// Re-deliver one dead letter now.
    Retry {
        /// Record id.
        id: String,

        /// Also retry a quarantined record.
        #[arg(short, long)]
        force: bool,
    },

    /// Re-deliver every dead letter.
    Replay {
        /// Include quarantined records.
        #[arg(short, long)]
        force: bool,
    },

    /// Remove all dead letters.
    Clear {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        force: bool,
    },

    /// Run one sweep over due records.
    Process,

    /// Show queue statistics.
    Stats,
}

/// Process exit code for a failed command.
///
/// Unknown or malformed ids exit with 2, everything else with 1.
pub fn exit_code(error: &anyhow::Error) -> u8 {
    if let Some(DlqError::RecordNotFound(_)) = error.downcast_ref::<DlqError>() {
        return 2;
    }
    if error.downcast_ref::<ParseRecordIdError>().is_some() {
        return 2;
    }
    1
}

/// Run one command. `input` answers confirmation prompts; `out` receives
/// command output.
pub async fn run<R, W>(cli: Cli, mut input: R, out: &mut W) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    let config = DlqConfig::from_env();
    config.validate()?;

    let store = FileDeadLetterStore::open(&cli.state).await?;
    debug!(state = %cli.state.display(), "dead letter snapshot loaded");
    let queue = DeadLetterQueue::new(store).with_config(config);

    if matches!(
        cli.command,
        Commands::Retry { .. } | Commands::Replay { .. } | Commands::Process
    ) {
        let handler = match &cli.outbox {
            Some(path) => OutboxHandler::open(path)?,
            None => OutboxHandler::stdout(),
        };
        queue.add_handler(handler);
    }

    match cli.command {
        Commands::List { limit, reason } => {
            let filter = RecordFilter {
                limit,
                reason,
                ..RecordFilter::default()
            };
            let records = queue.list(&filter).await?;
            for record in &records {
                writeln!(out, "{}", summary_line(record))?;
            }
            writeln!(out, "{} dead letter(s)", records.len())?;
        }

        Commands::Show { id } => {
            let id: RecordId = id.parse()?;
            let record = queue.get(id).await?.ok_or(DlqError::RecordNotFound(id))?;
            writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
        }

        Commands::Retry { id, force } => {
            let id: RecordId = id.parse()?;
            let outcome = queue.retry(id, force).await?;
            writeln!(out, "{}", describe(id, &outcome))?;
        }

        Commands::Replay { force } => {
            let report = queue.replay(force).await?;
            for (id, outcome) in &report.outcomes {
                writeln!(out, "{}", describe(*id, outcome))?;
            }
            let s = &report.summary;
            writeln!(
                out,
                "replayed {}: {} resolved, {} failed, {} skipped",
                s.examined,
                s.resolved,
                s.failed(),
                s.skipped
            )?;
        }

        Commands::Clear { force } => {
            let total = queue.stats().await?.total;
            if !force && !confirm(&mut input, out, total)? {
                writeln!(out, "aborted")?;
                return Ok(());
            }
            let removed = queue.clear().await?;
            writeln!(out, "removed {removed} dead letter(s)")?;
        }

        Commands::Process => {
            let report = queue.process().await?;
            writeln!(
                out,
                "swept {}: {} resolved, {} rescheduled, {} quarantined, {} skipped",
                report.examined,
                report.resolved,
                report.rescheduled,
                report.quarantined,
                report.skipped
            )?;
        }

        Commands::Stats => {
            let stats = queue.stats().await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&stats)?)?;
        }
    }

    Ok(())
}

fn confirm<R: BufRead, W: Write>(input: &mut R, out: &mut W, total: usize) -> Result<bool> {
    write!(out, "remove all {total} dead letter(s)? [y/N] ")?;
    out.flush()?;

    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("cannot read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn summary_line(record: &DeadLetterRecord) -> String {
    let state = if record.is_quarantined() {
        "quarantined".to_string()
    } else {
        match record.next_attempt_at() {
            Some(at) if at > Utc::now() => format!("waiting until {}", at.to_rfc3339()),
            _ => "eligible".to_string(),
        }
    };

    format!(
        "{}  {:<14}  attempts={}  {}  {}  {}",
        record.id(),
        record.reason().as_str(),
        record.attempt_count(),
        state,
        record.subscription_id().unwrap_or("-"),
        record.timestamp().to_rfc3339(),
    )
}

fn describe(id: RecordId, outcome: &RetryOutcome) -> String {
    match outcome {
        RetryOutcome::Resolved { attempt_count } => {
            format!("{id}: re-delivered after {attempt_count} attempt(s)")
        }
        RetryOutcome::Failed {
            error,
            attempt_count,
            quarantined: true,
            ..
        } => format!("{id}: failed (attempt {attempt_count}), quarantined: {error}"),
        RetryOutcome::Failed {
            error,
            attempt_count,
            next_attempt_at,
            ..
        } => match next_attempt_at {
            Some(at) => format!(
                "{id}: failed (attempt {attempt_count}), next attempt at {}: {error}",
                at.to_rfc3339()
            ),
            None => format!("{id}: failed (attempt {attempt_count}): {error}"),
        },
        RetryOutcome::Skipped(SkipReason::Quarantined) => {
            format!("{id}: quarantined, use --force to retry")
        }
        RetryOutcome::Skipped(reason) => format!("{id}: skipped ({reason:?})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::Path;

    use serde_json::json;
    use uno_events::NewDeadLetter;
    use uno_infra::dlq::DeadLetterStore;

    fn cli(state: &Path, outbox: &Path, args: &[&str]) -> Cli {
        let mut argv = vec![
            "uno-dlq".to_string(),
            "--state".to_string(),
            state.display().to_string(),
            "--outbox".to_string(),
            outbox.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        Cli::try_parse_from(argv).unwrap()
    }

    async fn seed(state: &Path, count: usize) -> Vec<RecordId> {
        let store = FileDeadLetterStore::open(state).await.unwrap();
        let mut ids = Vec::new();
        for i in 0..count {
            let record = DeadLetterRecord::new(
                NewDeadLetter::new(json!({"order_id": i}), DeadLetterReason::HandlerFailed)
                    .with_error("boom")
                    .with_subscription_id("payments"),
                Utc::now(),
            );
            ids.push(record.id());
            store.add(record).await.unwrap();
        }
        ids
    }

    async fn exec(cli: Cli, stdin: &str) -> (Result<()>, String) {
        let mut out = Vec::new();
        let result = run(cli, Cursor::new(stdin.as_bytes().to_vec()), &mut out).await;
        (result, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn retry_writes_outbox_and_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("dlq.json");
        let outbox = dir.path().join("outbox.jsonl");
        let ids = seed(&state, 1).await;

        let (result, output) = exec(
            cli(&state, &outbox, &["retry", &ids[0].to_string()]),
            "",
        )
        .await;
        result.unwrap();
        assert!(output.contains("re-delivered"));

        let lines = std::fs::read_to_string(&outbox).unwrap();
        let line: serde_json::Value = serde_json::from_str(lines.trim()).unwrap();
        assert_eq!(line["event"]["order_id"], 0);

        let store = FileDeadLetterStore::open(&state).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_id_exits_with_two() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("dlq.json");
        let outbox = dir.path().join("outbox.jsonl");
        let missing = RecordId::new();

        let (result, _) = exec(cli(&state, &outbox, &["show", &missing.to_string()]), "").await;
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), format!("no such dead letter: {missing}"));
        assert_eq!(exit_code(&err), 2);

        let (result, _) = exec(cli(&state, &outbox, &["retry", "not-an-id"]), "").await;
        assert_eq!(exit_code(&result.unwrap_err()), 2);
    }

    #[tokio::test]
    async fn clear_asks_for_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("dlq.json");
        let outbox = dir.path().join("outbox.jsonl");
        seed(&state, 5).await;

        let (result, output) = exec(cli(&state, &outbox, &["clear"]), "n\n").await;
        result.unwrap();
        assert!(output.contains("aborted"));

        let (result, output) = exec(cli(&state, &outbox, &["clear"]), "yes\n").await;
        result.unwrap();
        assert!(output.contains("removed 5"));

        let (result, output) = exec(cli(&state, &outbox, &["list"]), "").await;
        result.unwrap();
        assert!(output.contains("0 dead letter(s)"));
    }

    #[tokio::test]
    async fn list_filters_by_reason() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("dlq.json");
        let outbox = dir.path().join("outbox.jsonl");
        seed(&state, 2).await;

        let (result, output) = exec(
            cli(&state, &outbox, &["list", "--reason", "timeout"]),
            "",
        )
        .await;
        result.unwrap();
        assert!(output.contains("0 dead letter(s)"));

        let (result, output) = exec(
            cli(&state, &outbox, &["list", "--reason", "handler-failed", "--limit", "1"]),
            "",
        )
        .await;
        result.unwrap();
        assert!(output.contains("HANDLER_FAILED"));
        assert!(output.contains("1 dead letter(s)"));
    }

    #[tokio::test]
    async fn replay_on_empty_state_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("dlq.json");
        let outbox = dir.path().join("outbox.jsonl");

        let (result, output) = exec(cli(&state, &outbox, &["replay"]), "").await;
        result.unwrap();
        assert!(output.contains("replayed 0"));
    }

    #[test]
    fn other_errors_exit_with_one() {
        let err = anyhow::Error::new(DlqError::unavailable("disk full"));
        assert_eq!(exit_code(&err), 1);
    }
}
