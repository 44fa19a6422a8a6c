pub mod api;
pub mod config;
pub mod event_channel;
pub mod session;
pub mod supervisor;
pub mod sync;
pub mod transfer;

pub use api::{ApiClient, ApiError};
pub use event_channel::{ChannelError, ChannelState, EventChannel};
pub use session::{Session, SessionManager};
pub use supervisor::{BackendCommand, BackendSupervisor, SupervisorError};
pub use sync::{SyncEngine, SyncError, SyncSnapshot, SyncUpdate};
pub use transfer::{FileTransfer, TransferError};
