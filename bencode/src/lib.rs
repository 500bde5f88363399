mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, Decoder};
pub use encode::encode;
pub use error::{Error, Result};
pub use value::{Dict, Value};
