//! ez-ffmpeg engine
//!
//! Walks a media library, measures each video's storage density in MB per
//! minute and re-encodes the ones over budget, replacing originals only when
//! the new file is verifiably shorter-or-equal in length, smaller and within
//! the rate limit.

pub mod budget;
pub mod encode;
pub mod event;
pub mod probe;
pub mod queue;
pub mod replace;
pub mod scan;
pub mod scratch;
pub mod session;
pub mod snapshot;
pub mod status_server;
pub mod validate;

#[cfg(all(test, unix))]
mod test_support;

pub use ez_ffmpeg_config as config;
pub use ez_ffmpeg_config::{Preset, ProcessingSpec, Settings};
pub use event::{
    Events, MetricColumn, RunEvent, RunMode, RunOutcome, RunState, RunSummary, Status, StopFlag,
};
pub use queue::{MediaFile, RunReport};
pub use session::{Session, SessionError};
pub use snapshot::{new_shared_snapshot, RowSnapshot, RunSnapshot, SharedSnapshot};
pub use status_server::{create_status_router, run_status_server, ServerError, DEFAULT_STATUS_ADDR};
