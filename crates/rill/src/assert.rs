/// Panics in debug builds, logs an error in release builds.
#[macro_export]
macro_rules! soft_panic {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) { panic!($($arg)*); } else { tracing::error!($($arg)*); }
    };
}

/// `debug_assert_eq!` that downgrades to an error log in release builds.
#[macro_export]
macro_rules! soft_assert_eq {
    ($left:expr, $right:expr $(,)?) => {
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!($left, $right);
        }
        #[cfg(not(debug_assertions))]
        {
            if !($left == $right) {
                tracing::error!(
                    "assertion failed: {} (left: `{:?}`, right: `{:?}`)",
                    stringify!($left == $right),
                    &$left,
                    &$right
                );
            }
        }
    };
}
