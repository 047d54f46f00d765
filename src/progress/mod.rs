mod stream;
mod tracker;

pub use stream::{chunk_stream, ProgressStream, BODY_CHUNK_SIZE};
pub use tracker::{PartProgress, ProgressCallback, ProgressTracker};
