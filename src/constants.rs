//! Application constants

/// Extensions accepted for uploaded videos (compared case-insensitively)
pub const ALLOWED_VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "avi", "mov"];

/// Multipart field carrying the uploaded video
pub const VIDEO_FIELD_NAME: &str = "video";

/// Maximum upload size for videos (200 MB)
pub const MAX_VIDEO_UPLOAD_SIZE: usize = 200 * 1024 * 1024;

/// Sub-directories allocated inside every run workspace
pub const UPLOADS_DIR: &str = "uploads";
pub const FRAMES_DIR: &str = "frames";
pub const RESULTS_DIR: &str = "inference_results";

/// Stem of the stored upload; the extension follows the uploaded file
pub const UPLOAD_STEM: &str = "input";

/// Prefix and extension of sampled frame files, e.g. `frame_0000.jpg`
pub const FRAME_FILE_PREFIX: &str = "frame_";
pub const FRAME_FILE_EXT: &str = "jpg";
