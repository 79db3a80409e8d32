pub mod config;
pub mod error;
pub mod mask;
pub mod model;
pub mod ops;

mod util;

pub use error::ModelError;
