pub mod health;
pub mod diagnostics;
pub mod error;
pub mod records;

pub use health::*;
pub use diagnostics::*;
pub use error::*;
pub use records::*;
