pub mod coordinator;
pub mod notifications;

pub use coordinator::{ChatSettings, CommunicationCoordinator, CommunicationOutcome};
pub use notifications::NotificationHub;
