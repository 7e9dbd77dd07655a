//! Skins: text templates with embedded macro tags.

pub mod encode;
mod parser;
pub(crate) mod render;
mod registry;

pub use encode::Encoding;
pub use parser::{FailMode, HandlerKind, Macro, Param, Part, Skin, SkinBody, StandardParams};
pub use registry::{GLOBAL_PROTOTYPE, SkinRegistry};
