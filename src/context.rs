// SPDX-License-Identifier: MPL-2.0

//! The outer-context contract this controller is hosted inside of: a
//! logging sink plus the reentrancy-guard discipline around user callbacks.

use std::cell::Cell;
use std::rc::Rc;

use log::Level;

/// What a hosting device-emulation process must provide to a [`crate::Controller`].
///
/// The distilled responsibility is logging; the reentrancy flag lives on the
/// implementor too, so that a single context value can refuse operations
/// (from unrelated code) while a removal callback is in flight.
pub trait Context {
    /// Emits a log message at the given level.
    fn log(&self, level: Level, msg: &str);

    /// Marks (or clears, when `active` is `false`) that a removal callback
    /// is currently executing. Implementors that don't care about
    /// reentrancy may make this a no-op.
    fn set_in_callback(&self, active: bool);

    /// Whether a removal callback is currently executing.
    fn in_callback(&self) -> bool;
}

/// A scoped guard that flips a [`Context`]'s reentrancy flag for its
/// lifetime, restoring it on drop even if the wrapped callback unwinds.
///
/// This replaces the plain set-before/clear-after flag flip the original
/// library used around its unregister callback: a panic inside the
/// callback would otherwise leave the flag stuck.
pub(crate) struct CallbackGuard<'a, C: Context + ?Sized> {
    ctx: &'a C,
}

impl<'a, C: Context + ?Sized> CallbackGuard<'a, C> {
    pub(crate) fn enter(ctx: &'a C) -> Self {
        ctx.set_in_callback(true);
        Self { ctx }
    }
}

impl<'a, C: Context + ?Sized> Drop for CallbackGuard<'a, C> {
    fn drop(&mut self) {
        self.ctx.set_in_callback(false);
    }
}

/// A minimal [`Context`] that forwards to the `log` crate and tracks the
/// reentrancy flag in a plain `Cell`.
///
/// Suitable for standalone use and for tests; a real device-emulation
/// server will usually implement [`Context`] directly on whatever object
/// already owns its socket and callback table.
#[derive(Default)]
pub struct LogContext {
    in_cb: Cell<bool>,
}

impl LogContext {
    /// Creates a new context with an empty reentrancy flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps this context in an `Rc` for sharing with a [`crate::Controller`].
    pub fn shared() -> Rc<Self> {
        Rc::new(Self::new())
    }
}

impl Context for LogContext {
    fn log(&self, level: Level, msg: &str) {
        log::log!(level, "{}", msg);
    }

    fn set_in_callback(&self, active: bool) {
        self.in_cb.set(active);
    }

    fn in_callback(&self) -> bool {
        self.in_cb.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_flag_on_normal_return() {
        let ctx = LogContext::new();
        assert!(!ctx.in_callback());
        {
            let _guard = CallbackGuard::enter(&ctx);
            assert!(ctx.in_callback());
        }
        assert!(!ctx.in_callback());
    }

    #[test]
    fn guard_restores_flag_on_unwind() {
        let ctx = LogContext::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = CallbackGuard::enter(&ctx);
            panic!("callback blew up");
        }));
        assert!(result.is_err());
        assert!(!ctx.in_callback());
    }
}
