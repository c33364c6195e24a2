pub mod collaborators;
pub mod context;
pub mod coordinator;
pub mod notifications;

pub use collaborators::{AllowAll, NetworkFilter, NoBuddies, NoShares, Notifier, Shares, UserList};
pub use context::EngineContext;
pub use coordinator::{TransferCoordinator, NEGOTIATION_TIMEOUT};
pub use notifications::{DesktopNotifier, LogNotifier, SystemNotifier};
