pub mod engine;
pub mod session;

pub use engine::DownloadManager;
pub use session::{DownloadSession, DownloadStatus};
