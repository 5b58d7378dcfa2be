#![allow(clippy::module_name_repetitions, unused_imports, unused_macros)]

#[cfg(feature = "tracing")]
mod imp {
    pub(crate) use tracing::debug;
    pub(crate) use tracing::error;
    pub(crate) use tracing::info;
    pub(crate) use tracing::instrument;
    pub(crate) use tracing::trace;
    pub(crate) use tracing::warn;
}

#[cfg(not(feature = "tracing"))]
mod imp {
    // Arguments are still type checked, so that call sites compile the
    // same way with and without the `tracing` feature.
    macro_rules! noop {
        ($($args:tt)*) => {{
            if false {
                let _args = format_args!($($args)*);
            }
        }};
    }

    macro_rules! noop_debug {
        ($($args:tt)*) => { $crate::log::noop!($($args)*) };
    }

    macro_rules! noop_error {
        ($($args:tt)*) => { $crate::log::noop!($($args)*) };
    }

    macro_rules! noop_info {
        ($($args:tt)*) => { $crate::log::noop!($($args)*) };
    }

    macro_rules! noop_trace {
        ($($args:tt)*) => { $crate::log::noop!($($args)*) };
    }

    macro_rules! noop_warn {
        ($($args:tt)*) => { $crate::log::noop!($($args)*) };
    }

    pub(crate) use noop_debug as debug;
    pub(crate) use noop_error as error;
    pub(crate) use noop_info as info;
    pub(crate) use noop;
    pub(crate) use noop_trace as trace;
    pub(crate) use noop_warn as warn;
}

pub(crate) use imp::*;
