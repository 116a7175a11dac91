mod any;
mod macros;

pub use any::AnyErr;

pub(crate) mod prelude {
    #[allow(unused_imports)]
    pub use error_stack::{bail, report, ResultExt};

    pub use super::any::AnyErr;
}
