//! Batch execution: orchestrator, handle, events.

mod control;
pub mod events;
mod handle;
mod orchestrator;
mod state;

#[cfg(test)]
mod tests;

pub use events::{dispatch, BatchEvent, BatchObserver};
pub use handle::BatchHandle;
pub use orchestrator::{
    BatchOrchestrator, DescriptionIndex, FsImageReader, ImageReader, NoDescriptions, PathSetIndex,
};
