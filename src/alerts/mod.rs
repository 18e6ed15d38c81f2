//! User-facing alert sink.
//!
//! Fire-and-forget by contract: notifying must never block or fail call
//! logic. The default sink logs; the CLI installs a channel sink that a
//! display loop drains.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    IncomingCall {
        session_id: String,
        display_name: String,
        wants_video: bool,
    },
    NetworkDegraded {
        session_id: String,
    },
    CaptureFailed {
        session_id: String,
        message: String,
    },
    MessageNotSaved {
        session_id: String,
        error: String,
    },
}

pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Default sink: alerts go to the log.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: Alert) {
        tracing::info!("Alert: {:?}", alert);
    }
}

/// Sink backed by an unbounded channel. A full or closed receiver is
/// ignored; the call path never waits on the UI.
pub struct ChannelAlertSink {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelAlertSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn notify(&self, alert: Alert) {
        let _ = self.tx.send(alert);
    }
}
