pub mod controller;
pub mod notifier;

pub use controller::{ChatController, Completion};
pub use notifier::Notifier;
