//! Result type definition and extension traits for Railway-Oriented Programming.
//!
//! Provides functional combinators for Result types, enabling clean error handling
//! without unwrap/expect/panic.

use crate::error::Error;

/// The standard Result type used throughout the orchestrator workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing safe combinators for `Result<T, Error>`.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self) -> Option<T>;

    /// Get the value or a default, logging the error if present.
    fn or_default_logged(self, default: T) -> T;

    /// Inspect the error without consuming the Result.
    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self;
}

impl<T: std::fmt::Debug> ResultExt<T> for Result<T> {
    fn into_option_logged(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("operation failed: {}", e);
                None
            }
        }
    }

    fn or_default_logged(self, default: T) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("operation failed, using default: {}", e);
                default
            }
        }
    }

    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}

/// Generic extension trait for any Result type, not just this crate's Result.
pub trait GenericResultExt<T, E> {
    /// Perform a side effect on Ok value without consuming the Result.
    fn tap_ok<F: FnOnce(&T)>(self, f: F) -> Self;

    /// Perform a side effect on Err value without consuming the Result.
    fn tap_err<F: FnOnce(&E)>(self, f: F) -> Self;

    /// Execute a fallible side effect on Ok, returning the original Result if effect succeeds.
    fn and_then_do<F: FnOnce(&T) -> std::result::Result<(), E>>(
        self,
        f: F,
    ) -> std::result::Result<T, E>;

    /// Map both Ok and Err in a single operation.
    fn bimap<U, F, EF, E2>(self, ok_fn: F, err_fn: EF) -> std::result::Result<U, E2>
    where
        F: FnOnce(T) -> U,
        EF: FnOnce(E) -> E2;
}

impl<T, E> GenericResultExt<T, E> for std::result::Result<T, E> {
    fn tap_ok<F: FnOnce(&T)>(self, f: F) -> Self {
        if let Ok(ref v) = self {
            f(v);
        }
        self
    }

    fn tap_err<F: FnOnce(&E)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }

    fn and_then_do<F: FnOnce(&T) -> std::result::Result<(), E>>(
        self,
        f: F,
    ) -> std::result::Result<T, E> {
        self.and_then(|v| f(&v).map(|()| v))
    }

    fn bimap<U, F, EF, E2>(self, ok_fn: F, err_fn: EF) -> std::result::Result<U, E2>
    where
        F: FnOnce(T) -> U,
        EF: FnOnce(E) -> E2,
    {
        match self {
            Ok(v) => Ok(ok_fn(v)),
            Err(e) => Err(err_fn(e)),
        }
    }
}

/// Extension trait for Option types providing Railway-style operations.
pub trait OptionExt<T> {
    /// Convert Option to Result with a lazy error message.
    fn ok_or_else_lazy<E, F: FnOnce() -> E>(self, err: F) -> std::result::Result<T, E>;

    /// Tap into Some value without consuming the Option.
    fn tap_some<F: FnOnce(&T)>(self, f: F) -> Self;

    /// Tap into None without consuming the Option.
    fn tap_none<F: FnOnce()>(self, f: F) -> Self;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_else_lazy<E, F: FnOnce() -> E>(self, err: F) -> std::result::Result<T, E> {
        self.ok_or_else(err)
    }

    fn tap_some<F: FnOnce(&T)>(self, f: F) -> Self {
        if let Some(ref v) = self {
            f(v);
        }
        self
    }

    fn tap_none<F: FnOnce()>(self, f: F) -> Self {
        if self.is_none() {
            f();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn result_into_option_ok() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.into_option_logged(), Some(42));
    }

    #[test]
    fn result_into_option_err() {
        let result: Result<i32> = Err(Error::Unknown("test".into()));
        assert_eq!(result.into_option_logged(), None);
    }

    #[test]
    fn result_or_default_logged_err() {
        let result: Result<i32> = Err(Error::Unknown("test".into()));
        assert_eq!(result.or_default_logged(99), 99);
    }

    #[test]
    fn tap_ok_runs_side_effect() {
        let mut observed = 0;
        let result: std::result::Result<i32, &str> = Ok(42);
        let _ = result.tap_ok(|v| observed = *v);
        assert_eq!(observed, 42);
    }

    #[test]
    fn bimap_maps_ok_and_err() {
        let ok: std::result::Result<i32, &str> = Ok(21);
        assert_eq!(ok.bimap(|v| v * 2, |e| e.len()), Ok(42));
        let err: std::result::Result<i32, &str> = Err("hello");
        let mapped: std::result::Result<i32, usize> = err.bimap(|v| v * 2, |e| e.len());
        assert_eq!(mapped, Err(5));
    }

    #[test]
    fn and_then_do_runs_effect_and_preserves_value() {
        let mut side_effect = false;
        let result: std::result::Result<i32, &str> = Ok(42);
        let final_result = result.and_then_do(|_| {
            side_effect = true;
            Ok(())
        });
        assert!(side_effect);
        assert_eq!(final_result, Ok(42));
    }

    #[test]
    fn ok_or_else_lazy_converts_none() {
        let opt: Option<i32> = None;
        assert_eq!(opt.ok_or_else_lazy(|| "missing value"), Err("missing value"));
    }
}
