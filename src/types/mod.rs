// ABOUTME: Type-safe identifiers and validated domain types.
// ABOUTME: Uses phantom types to prevent ID confusion at compile time.

mod id;
mod image_ref;
mod manifest_name;

pub use id::{ContainerId, Id, PodId};
pub use image_ref::{ImageRef, ParseImageRefError};
pub use manifest_name::{ManifestName, ManifestNameError};
