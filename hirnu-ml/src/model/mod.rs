//! Adapter fusion and base-model download.

pub mod download;
pub mod fuse;

pub use download::{DEFAULT_DOWNLOAD_DIR, ModelDownloader};
pub use fuse::{FuseRequest, ModelFuser};
