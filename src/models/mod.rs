pub mod enums;
pub mod document;
pub mod record;
pub mod profile;

pub use enums::*;
pub use document::*;
pub use record::*;
pub use profile::*;
