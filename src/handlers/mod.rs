pub mod health;
pub mod diagnostics;
pub mod presence;
pub mod ws_upgrade;

pub use health::*;
pub use diagnostics::*;
pub use presence::*;
pub use ws_upgrade::{ws_document, ws_public_document};
