mod de;
mod error;

pub use de::{from_str, Deserializer};
pub use error::{Error, Result};
