//! Per-download session records and their on-disk store.

pub mod model;
pub mod store;

pub use model::{DownloadSession, DownloadStatus};
pub use store::SessionStore;
