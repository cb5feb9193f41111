//! Invariant checks for the transport core. A tripped check is a logic
//! bug, never a peer-controlled condition: debug builds panic so the bug
//! surfaces in tests, release builds report through `tracing` and keep
//! the connection limping, since one broken link must not take the whole
//! control plane down with it.
//!
//! Checks that fire with a connection in scope should pass `link:` so the
//! report carries the same label every other trace line on that
//! connection does.

/// Reports an unreachable condition: panic in debug, `tracing::error!` in
/// release.
///
/// `safe_panic!(link: label, "...")` tags the release report with the
/// owning connection's label.
#[macro_export]
macro_rules! safe_panic {
    (link: $link:expr, $($arg:tt)*) => {
        if cfg!(debug_assertions) {
            panic!($($arg)*)
        } else {
            tracing::error!(link = %$link, $($arg)*)
        }
    };
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            panic!($($arg)*)
        } else {
            tracing::error!($($arg)*)
        }
    };
}

/// Checks a state-engine invariant, reporting through [`safe_panic!`]
/// when it does not hold. The condition is evaluated in release builds
/// too; callers must arrange their own degraded path after the report.
#[macro_export]
macro_rules! safe_assert {
    (link: $link:expr, $cond:expr $(,)?) => {
        if !$cond {
            $crate::safe_panic!(link: $link, "invariant broken: {}", stringify!($cond));
        }
    };
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::safe_panic!("invariant broken: {}", stringify!($cond));
        }
    };
}

/// Equality form of [`safe_assert!`], showing both values in the report.
#[macro_export]
macro_rules! safe_assert_eq {
    (link: $link:expr, $left:expr, $right:expr $(,)?) => {{
        let (l, r) = (&$left, &$right);
        if l != r {
            $crate::safe_panic!(
                link: $link,
                "invariant broken: {} (left: {:?}, right: {:?})",
                stringify!($left == $right),
                l,
                r
            );
        }
    }};
    ($left:expr, $right:expr $(,)?) => {{
        let (l, r) = (&$left, &$right);
        if l != r {
            $crate::safe_panic!(
                "invariant broken: {} (left: {:?}, right: {:?})",
                stringify!($left == $right),
                l,
                r
            );
        }
    }};
}
