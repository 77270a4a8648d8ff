pub mod error;
pub mod reid;
pub mod roi_geom;
pub mod types;

pub use error::{Result, VisionError};
