//! Wire types for the `codex exec --experimental-json` event stream.

pub mod decode;
pub mod events;
pub mod items;

pub use decode::{decode_event, decode_item, DecodeError};
pub use events::*;
pub use items::*;
