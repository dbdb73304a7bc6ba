pub mod handlers;
pub mod handoff;
pub mod registry;
pub mod session;
pub mod stager;

pub use handoff::RemoteStore;
pub use registry::{ConnectionId, UploadRegistry};
pub use session::{SessionState, UploadSession, UploadStatus};
