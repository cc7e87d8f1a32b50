//! Informational records emitted by the retry wrapper and the heartbeat loop.

use tokio::sync::mpsc;

use crate::RegistryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub error: Option<RegistryError>,
    pub message: String,
}

pub type FeedbackSender = mpsc::UnboundedSender<Feedback>;
pub type FeedbackReceiver = mpsc::UnboundedReceiver<Feedback>;

impl Feedback {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            error: None,
            message: message.into(),
        }
    }

    pub fn failure(error: RegistryError, message: impl Into<String>) -> Self {
        Self {
            error: Some(error),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub fn channel() -> (FeedbackSender, FeedbackReceiver) {
    mpsc::unbounded_channel()
}

/// Delivers `feedback` if anyone listens. A missing or closed receiver is not an error.
pub fn emit(sender: Option<&FeedbackSender>, feedback: Feedback) {
    if let Some(sender) = sender {
        let _ = sender.send(feedback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_tolerates_closed_receiver() {
        let (tx, rx) = channel();
        drop(rx);
        emit(Some(&tx), Feedback::info("still fine"));
        emit(None, Feedback::info("nobody listening"));
    }

    #[tokio::test]
    async fn emitted_records_arrive_in_order() {
        let (tx, mut rx) = channel();
        emit(Some(&tx), Feedback::info("first"));
        emit(Some(&tx), Feedback::failure(RegistryError::Cancelled, "second"));

        assert_eq!(rx.recv().await.unwrap().message, "first");
        let second = rx.recv().await.unwrap();
        assert!(second.is_error());
        assert_eq!(second.error, Some(RegistryError::Cancelled));
    }
}
