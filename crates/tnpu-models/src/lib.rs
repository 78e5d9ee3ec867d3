#![deny(unsafe_code)]

//! Model image format for the trusted NPU.
//!
//! # Format
//!
//! - **Header** (32 bytes): magic, version, security type, execution mode,
//!   metadata length, code length, key set, hardware target
//! - **Metadata**: resource-sizing descriptor (code/pool areas,
//!   page-table pages) and the per-layer operation table used for profiling
//! - **Payload**: code, then whatever the secure peer consumes
//!
//! Header and metadata form the *public data* the control plane may read.
//! The payload is opaque and may be encrypted.
//!
//! # Example
//!
//! ```no_run
//! use tnpu_models::ModelImage;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = ModelImage::from_file("mobilenet.tnpm")?;
//! let sizing = model.sizing();
//!
//! println!("code {} B, page table {} B", sizing.code_size, sizing.page_table_size);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod builder;
mod error;
mod header;
mod image;
mod resources;

pub use builder::ModelBuilder;
pub use error::{ModelError, Result};
pub use header::{ExecutionMode, ModelHeader, SecurityType, FORMAT_VERSION, HEADER_SIZE, MODEL_MAGIC};
pub use image::ModelImage;
pub use resources::{AreaKind, MemoryArea, ResourceDescriptor, ResourceSizing};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{ModelBuilder, ModelHeader, ModelImage, ResourceDescriptor, ResourceSizing, Result};
}
