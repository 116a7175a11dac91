#![allow(missing_docs)]
// Above needed because rstest fixture macros seem to produce undocumented functions and structs.

use rstest::*;
use tracing::Level;

/// Include this in a test to turn on stdout logging globally.
#[fixture]
pub fn logging() {
    // Repeated init across tests in one binary is fine, only the first wins.
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Default modules to bring into scope within test modules.
pub mod prelude {
    pub use rstest::*;

    pub use super::logging;
    pub use crate::prelude::*;
}
