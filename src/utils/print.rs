//! Logging setup and the `pf_*!` family of node-prefixed log macros.

use std::cell::RefCell;

use env_logger::Builder;
use log::LevelFilter;

thread_local! {
    /// Short prefix identifying the current node in log output, e.g. "n2".
    /// Set once by `node::Node::run` before any worker task logs; every
    /// `pf_*!` call site picks it up without threading an id through every
    /// function signature.
    pub static ME: RefCell<String> = RefCell::new(String::new());
}

/// Sets the thread-local node prefix used by the `pf_*!` macros. Call once
/// per OS thread / tokio worker that should prefix its log lines.
pub fn set_me(prefix: impl Into<String>) {
    ME.with(|me| *me.borrow_mut() = prefix.into());
}

fn me_prefix() -> String {
    ME.with(|me| me.borrow().clone())
}

/// Colorizes the node prefix (cyan, bold) the way the teacher's `pf_*!`
/// macros tag each line -- `color_print` degrades to plain text on
/// terminals without color support (the `terminfo` feature we depend on).
#[doc(hidden)]
pub fn __me_prefix() -> String {
    let me = me_prefix();
    if me.is_empty() {
        String::new()
    } else {
        color_print::cformat!("<bold><cyan>{}</cyan></bold>", me)
    }
}

/// Initializes `env_logger` at the given level filter, matching the
/// teacher's `logger_init()` convention: one call near the top of `main`.
pub fn logger_init(level: LevelFilter) {
    let mut builder = Builder::from_default_env();
    builder.filter_level(level);
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

#[macro_export]
macro_rules! pf_error {
    ($($arg:tt)*) => {
        log::error!("{} {}", $crate::utils::print::__me_prefix(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pf_warn {
    ($($arg:tt)*) => {
        log::warn!("{} {}", $crate::utils::print::__me_prefix(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pf_info {
    ($($arg:tt)*) => {
        log::info!("{} {}", $crate::utils::print::__me_prefix(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pf_debug {
    ($($arg:tt)*) => {
        log::debug!("{} {}", $crate::utils::print::__me_prefix(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pf_trace {
    ($($arg:tt)*) => {
        log::trace!("{} {}", $crate::utils::print::__me_prefix(), format!($($arg)*))
    };
}
