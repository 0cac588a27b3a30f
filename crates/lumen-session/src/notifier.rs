use lumen_core::{ChatEvent, GenerationState, LogEntry, LogLevel, ModelLifecycleState};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

/// One-way notification channel from the controller to the UI layer.
///
/// Sends never fail the caller: a dropped receiver only means nobody is
/// rendering anymore.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: UnboundedSender<ChatEvent>,
}

impl Notifier {
    pub fn channel() -> (Self, UnboundedReceiver<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.tx.send(event);
    }

    pub fn lifecycle(&self, state: &ModelLifecycleState) {
        self.emit(ChatEvent::Lifecycle(state.clone()));
    }

    pub fn generation(&self, state: &GenerationState) {
        self.emit(ChatEvent::Generation(state.clone()));
    }

    pub fn progress(&self, text: &str) {
        self.emit(ChatEvent::Progress(format!("Loading: {}", text)));
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.emit(ChatEvent::Log(LogEntry::new(LogLevel::Info, message)));
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.emit(ChatEvent::Log(LogEntry::new(LogLevel::Warn, message)));
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{}", message);
        self.emit(ChatEvent::Log(LogEntry::new(LogLevel::Error, message)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_in_order() {
        let (notifier, mut rx) = Notifier::channel();
        notifier.progress("Warming up m1");
        notifier.warn("slow");

        assert_eq!(rx.try_recv().unwrap(), ChatEvent::Progress("Loading: Warming up m1".into()));
        match rx.try_recv().unwrap() {
            ChatEvent::Log(entry) => {
                assert_eq!(entry.level, LogLevel::Warn);
                assert_eq!(entry.message, "slow");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.error("nobody listening");
        notifier.lifecycle(&ModelLifecycleState::Unloaded);
    }
}
