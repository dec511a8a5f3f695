//! Supporting utility macros.

/// Trace when `verbose` feature enabled.
macro_rules! verbose {
    ($($tt:tt)*) => {
        #[cfg(feature = "verbose")]
        tracing::trace!($($tt)*)
    };
}

/// Log with the given level when `log` feature enabled.
///
/// Arguments are not evaluated otherwise, prefix captured bindings with `_`.
macro_rules! report {
    ($level:ident, $($tt:tt)*) => {
        #[cfg(feature = "log")]
        log::$level!($($tt)*)
    };
}

pub(crate) use verbose;
pub(crate) use report;
