//! Logging shims that forward to `defmt` when the `defmt` feature is enabled.
//! Without it the arguments are still evaluated by reference, so values that
//! are only logged do not turn into unused bindings.

#[collapse_debuginfo(yes)]
macro_rules! debug {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        #[cfg(feature = "defmt")]
        {
            defmt::debug!($fmt $(, $arg)*);
        }
        #[cfg(not(feature = "defmt"))]
        {
            let _ = ($(&$arg),*);
        }
    };
}
pub(crate) use debug;

#[collapse_debuginfo(yes)]
macro_rules! info {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        #[cfg(feature = "defmt")]
        {
            defmt::info!($fmt $(, $arg)*);
        }
        #[cfg(not(feature = "defmt"))]
        {
            let _ = ($(&$arg),*);
        }
    };
}
pub(crate) use info;

#[collapse_debuginfo(yes)]
macro_rules! warni {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        #[cfg(feature = "defmt")]
        {
            defmt::warn!($fmt $(, $arg)*);
        }
        #[cfg(not(feature = "defmt"))]
        {
            let _ = ($(&$arg),*);
        }
    };
}
pub(crate) use warni as warn;

#[collapse_debuginfo(yes)]
macro_rules! error {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        #[cfg(feature = "defmt")]
        {
            defmt::error!($fmt $(, $arg)*);
        }
        #[cfg(not(feature = "defmt"))]
        {
            let _ = ($(&$arg),*);
        }
    };
}
pub(crate) use error;
