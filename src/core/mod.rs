mod errors;
mod session;
mod traits;
mod types;


pub use errors::{Result, UploadError};
pub use session::UploadSession;
pub use traits::{CredentialProvider, InitiatedUpload, PartPayload, PartReport, UploadBackend};
pub use types::{
    guess_content_type,
    FileSource,
    MultipartConfig,
    PartRange,
    PartResult,
    SessionId,
    UploadEvent,
    UploadMetadata,
    UploadOutcome,
    UploadProgress,
    UploadState,
    DEFAULT_CHUNK_SIZE,
};
