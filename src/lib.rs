pub mod calib_io;
pub mod error;
pub mod features;
pub mod matcher;
pub mod pipeline;
pub mod pose;
pub mod registrar;
pub mod stats;

pub use error::{CoreError, Result};
pub use pipeline::Pipeline;
pub use pose::Pose;
