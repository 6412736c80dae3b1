//! Events a running migration reports to its owner.
//!
//! The migration runs on its own thread. Everything it has to tell the
//! outside world, including questions that need an answer before it can
//! continue, travels over one unbounded channel as [`MigrationEvent`]s.

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::ui::{UiAnswer, UiDelegate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionKind {
    YesNo,
    YesNoSkip,
}

#[derive(Debug)]
pub enum MigrationEvent {
    Info(String),
    Error(String),
    /// Table `done` of `total` is being copied.
    Progress {
        table: String,
        done: usize,
        total: usize,
    },
    /// `done` of `total` rows of `table` have been copied.
    TableProgress {
        table: String,
        done: usize,
        total: usize,
    },
    /// The worker is blocked until `reply` receives an answer.
    Question {
        text: String,
        kind: QuestionKind,
        reply: oneshot::Sender<UiAnswer>,
    },
    Completed(bool),
}

impl MigrationEvent {
    /// Answer a question event through `ui`. Any other event is handed back.
    pub fn answer_with(self, ui: &mut dyn UiDelegate) -> Option<MigrationEvent> {
        match self {
            MigrationEvent::Question { text, kind, reply } => {
                let answer = match kind {
                    QuestionKind::YesNo => ui.question_yes_no(&text),
                    QuestionKind::YesNoSkip => ui.question_yes_no_skip(&text),
                };
                if reply.send(answer).is_err() {
                    warn!("Migration worker stopped waiting for an answer");
                }
                None
            }
            other => Some(other),
        }
    }
}

/// Sending side used by the worker. A dropped receiver is not an error:
/// the migration keeps going and only the reporting is lost.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<MigrationEvent>,
}

impl Reporter {
    pub fn new(tx: mpsc::UnboundedSender<MigrationEvent>) -> Self {
        Self { tx }
    }

    /// A reporter and the receiver its events arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MigrationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, event: MigrationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.send(MigrationEvent::Info(message));
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{}", message);
        self.send(MigrationEvent::Error(message));
    }

    pub fn progress(&self, table: &str, done: usize, total: usize) {
        self.send(MigrationEvent::Progress {
            table: table.to_string(),
            done,
            total,
        });
    }

    pub fn table_progress(&self, table: &str, done: usize, total: usize) {
        self.send(MigrationEvent::TableProgress {
            table: table.to_string(),
            done,
            total,
        });
    }

    pub fn completed(&self, success: bool) {
        self.send(MigrationEvent::Completed(success));
    }

    /// Ask a question and block until it is answered. If nobody is left to
    /// answer, the question counts as declined.
    pub fn ask(&self, text: &str, kind: QuestionKind) -> UiAnswer {
        let (reply, answer) = oneshot::channel();
        self.send(MigrationEvent::Question {
            text: text.to_string(),
            kind,
            reply,
        });
        answer.blocking_recv().unwrap_or(UiAnswer::No)
    }
}
