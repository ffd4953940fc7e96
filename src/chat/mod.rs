//! Support chat: resolving the other party and keeping a conversation in sync.

pub mod engine;
pub mod resolver;
pub mod store;
pub mod surface;
pub mod view;

pub use engine::{SyncConfig, SyncEngine, SyncState};
pub use resolver::{AdminLookup, Availability, CounterpartyResolver};
pub use store::{ChangeNotifier, MessageStore, ProfileDirectory, Subscription};
pub use surface::{AdminConsole, ChatBackend, SurfaceKind, TenantChat};
pub use view::LocalView;
