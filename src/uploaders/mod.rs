pub mod multipart;

pub use multipart::MultipartUploader;
