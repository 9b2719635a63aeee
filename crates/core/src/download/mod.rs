//! Shared upstream downloaders and their per-project bindings.

mod binding;
mod shared;
mod traits;

pub use binding::ProjectDownloadBinding;
pub use shared::{PollSummary, SharedDownloadResource};
pub use traits::{
    DownloadError, DownloadFactory, DownloadSourceLister, FileDownloader, RemoteFileRef, SourceId,
    DEFAULT_POLL_INTERVAL,
};
