//! Helper macros for logging (console printing).

/// Log TRACE message.
///
/// Example:
/// ```no_run
/// use replistate::pf_trace;
/// let msg = "hello";
/// pf_trace!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($arg:tt)*) => {
        log::trace!($($arg)*)
    };
}

/// Log DEBUG message.
///
/// Example:
/// ```no_run
/// use replistate::pf_debug;
/// let msg = "hello";
/// pf_debug!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

/// Log INFO message.
///
/// Example:
/// ```no_run
/// use replistate::pf_info;
/// let msg = "hello";
/// pf_info!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($($arg:tt)*) => {
        log::info!($($arg)*)
    };
}

/// Log WARN message.
///
/// Example:
/// ```no_run
/// use replistate::pf_warn;
/// let msg = "hello";
/// pf_warn!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($($arg:tt)*) => {
        log::warn!($($arg)*)
    };
}

/// Log ERROR message.
///
/// Example:
/// ```no_run
/// use replistate::pf_error;
/// let msg = "hello";
/// pf_error!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($($arg:tt)*) => {
        log::error!($($arg)*)
    };
}

/// Log an error string to logger and then return a `ReplistateError`
/// containing the string.
///
/// Example:
/// ```no_run
/// use replistate::logged_err;
/// let msg = "hello";
/// let e: Result<(), replistate::utils::ReplistateError> =
///     logged_err!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($arg:tt)*) => {{
        $crate::pf_error!($($arg)*);
        Err($crate::utils::ReplistateError::msg(format!($($arg)*)))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::ReplistateError;

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!("interesting message"),
            Err::<(), _>(ReplistateError::msg("interesting message"))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!("got {} to print", 777),
            Err::<(), _>(ReplistateError::msg("got 777 to print"))
        );
    }
}
