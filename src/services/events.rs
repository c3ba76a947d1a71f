use tokio::sync::mpsc;

use crate::models::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// State changes pushed to whatever front end is listening.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Notice {
        severity: Severity,
        title: String,
        description: String,
    },
    MessageAdded {
        conversation_id: String,
        message: Message,
    },
    Token {
        conversation_id: String,
        delta: String,
    },
    Loading {
        conversation_id: String,
        loading: bool,
    },
    ReplyDiscarded {
        conversation_id: String,
    },
    ConversationUpdated {
        conversation_id: String,
    },
}

/// Sending half of the event channel. A sink without a receiver drops events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ChatEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ChatEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn notice(&self, severity: Severity, title: impl Into<String>, description: impl Into<String>) {
        self.emit(ChatEvent::Notice {
            severity,
            title: title.into(),
            description: description.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notice_reaches_receiver() {
        let (sink, mut rx) = EventSink::channel();
        sink.notice(Severity::Warning, "No endpoint", "Add one first");
        match rx.recv().await {
            Some(ChatEvent::Notice { severity, title, .. }) => {
                assert_eq!(severity, Severity::Warning);
                assert_eq!(title, "No endpoint");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        EventSink::disabled().notice(Severity::Info, "a", "b");
    }
}
