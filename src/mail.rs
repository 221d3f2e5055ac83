//! Error-report intake for the mail shipper.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::error;

/// Hands error reports to the mail shipper.
///
/// Reports are logged and queued onto an unbounded channel; the SMTP
/// consumer on the other end lives outside this crate. Without a
/// consumer the mailer just logs.
#[derive(Debug, Clone, Default)]
pub struct Mailer {
    tx: Option<UnboundedSender<String>>,
}

impl Mailer {
    /// A mailer that only logs.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A mailer feeding a shipper; the receiver is the shipper's intake.
    pub fn channel() -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Reports an error.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{message}");
        if let Some(tx) = &self.tx {
            let _ = tx.send(message);
        }
    }
}
