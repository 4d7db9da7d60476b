pub mod error;
pub mod exitcodes;

pub use error::{CloakfsError, CloakfsResult};
