//! Recast Project Model
//!
//! Defines the data contracts of an export job:
//! - **Trim:** retained source ranges and the effective ↔ source time mapping
//! - **Camera:** picture-in-picture overlay settings
//! - **Job:** media references and the job file format
//!
//! All times are signed microseconds.

pub mod camera;
pub mod job;
pub mod trim;

pub use camera::*;
pub use job::*;
pub use trim::*;
