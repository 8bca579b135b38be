//! kinface-img: image input handling for the analysis service.
//!
//! Decodes `data:image/<fmt>;base64,` payloads into RGB images, enforces the
//! format and size limits, hashes payloads for logging and cuts padded face
//! crops.

pub mod crop;
pub mod decode;

pub use crop::{crop_face_region, DEFAULT_CROP_PADDING};
pub use decode::{decode_data_url, image_hash, load_file, DataUrl, ImageInputError, SUPPORTED_FORMATS};
