//! Logging macros that prefix every line with the process identity.

use std::sync::OnceLock;

use env_logger::Env;

/// Identity of this process (e.g., a controller agent tag) used as logging
/// prefix. Left unset, lines are prefixed with `-`.
pub static ME: OnceLock<String> = OnceLock::new();

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!("claim {} by {}", key, holder);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => {
        log::trace!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log DEBUG message with parenthesized prefix.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => {
        log::debug!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log INFO message with parenthesized prefix.
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => {
        log::info!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log WARN message with parenthesized prefix.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => {
        log::warn!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log ERROR message with parenthesized prefix.
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => {
        log::error!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Initialize `env_logger` to the default lease manager configuration if it
/// hasn't been initialized yet. Level defaults to `info` unless `RUST_LOG`
/// says otherwise.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Log an error string to logger and then return a generic `LeaseError`
/// containing the string.
///
/// Example:
/// ```no_compile
/// return logged_err!("invalid sweep interval {:?}", dur);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::LeaseError::msg(format!($($fmt_args)*)))
        }
    };
}

#[cfg(test)]
mod print_tests {
    use crate::utils::LeaseError;

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!("coordinator gone"),
            Err::<(), LeaseError>(LeaseError::msg("coordinator gone"))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!("sweep failed {} times", 3),
            Err::<(), LeaseError>(LeaseError::msg("sweep failed 3 times"))
        );
    }

    #[test]
    fn logger_init_twice() {
        super::logger_init();
        super::logger_init();
    }
}
