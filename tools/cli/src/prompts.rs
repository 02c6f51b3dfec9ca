//! Console implementation of the user-prompt capability.
//!
//! The tray and dialog surfaces live outside this binary; on a terminal,
//! questions fall back to stdin. Each read is pushed onto the blocking
//! pool so the dispatcher task is never wedged on a quiet console.

use async_trait::async_trait;
use std::io::{BufRead, Write};
use tracing::warn;

use studiosync_sync::{ConflictChoice, SelfLockChoice, UserPrompt};

pub struct ConsolePrompt;

fn ask(question: String) -> Option<String> {
    print!("{} ", question);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(answer.trim().to_string()),
    }
}

async fn ask_blocking(question: String) -> Option<String> {
    tokio::task::spawn_blocking(move || ask(question))
        .await
        .unwrap_or(None)
}

async fn ask_choice(question: String) -> Option<String> {
    ask_blocking(question).await.map(|answer| answer.to_lowercase())
}

#[async_trait]
impl UserPrompt for ConsolePrompt {
    async fn conflict(&self, song: &str) -> ConflictChoice {
        let question = format!(
            "{} has changed both locally and remotely! Keep which one? \
             Proceeding may cause loss of data. [local/remote/skip]",
            song
        );
        loop {
            match ask_choice(question.clone()).await.as_deref() {
                Some("local") => return ConflictChoice::KeepLocal,
                Some("remote") => return ConflictChoice::KeepRemote,
                Some("skip") | None => return ConflictChoice::Skip,
                Some(_) => continue,
            }
        }
    }

    async fn archived_pull(&self, song: &str) -> bool {
        let question = format!(
            "{} is archived and cannot be pushed. Overwrite local files with the server copy? [y/N]",
            song
        );
        matches!(ask_choice(question).await.as_deref(), Some("y") | Some("yes"))
    }

    async fn self_lock(&self, target: &str) -> SelfLockChoice {
        let question = format!(
            "A sync of {} is still in progress or has stopped unexpectedly. \
             [proceed/override/abort]",
            target
        );
        loop {
            match ask_choice(question.clone()).await.as_deref() {
                Some("proceed") => return SelfLockChoice::Proceed,
                Some("override") => return SelfLockChoice::Override,
                Some("abort") | None => return SelfLockChoice::Abort,
                Some(other) => {
                    warn!(answer = other, "unrecognized choice");
                }
            }
        }
    }

    async fn changelog(&self, song: &str) -> Option<String> {
        let question = format!(
            "Summarize the changes you made to {} (empty line to skip):",
            song
        );
        ask_blocking(question).await.filter(|entry| !entry.is_empty())
    }
}
