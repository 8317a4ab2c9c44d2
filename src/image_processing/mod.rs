// Image processing module - codec backends and the editor capability
mod editor;
pub mod formats;
mod types;

pub use editor::{CodecRegistry, EditorBackend, ImageEditor, ImageRsBackend, ImageRsEditor};
pub use types::ImageSize;
