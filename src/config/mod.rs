pub mod loader;
pub mod settings;
pub mod types;

pub use loader::*;
pub use settings::*;
pub use types::*;
