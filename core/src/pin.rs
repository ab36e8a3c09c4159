//! Address-stable values for the duration of a native call.
//!
//! Values whose address is handed to C (config structs with nested
//! pointers) live in a [`Pinned`] box. Each one holds a token counted per
//! thread, so tests can check that every pin was released, including on
//! error paths.

use std::cell::Cell;
use std::marker::PhantomData;
use std::pin::Pin;

use tracing::trace;

thread_local! {
    static ACTIVE: Cell<usize> = const { Cell::new(0) };
}

/// Pins currently held on this thread.
pub fn active_pins() -> usize {
    ACTIVE.with(Cell::get)
}

/// Proof that one pin is outstanding. Released on drop.
#[derive(Debug)]
pub struct PinToken {
    // Counted per thread, so the token must stay on it.
    _not_send: PhantomData<*const ()>,
}

impl PinToken {
    fn acquire() -> Self {
        ACTIVE.with(|n| n.set(n.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for PinToken {
    fn drop(&mut self) {
        ACTIVE.with(|n| n.set(n.get().saturating_sub(1)));
    }
}

/// A heap value that will not move until dropped.
#[derive(Debug)]
pub struct Pinned<T> {
    value: Pin<Box<T>>,
    _token: PinToken,
}

impl<T> Pinned<T> {
    pub fn new(value: T) -> Self {
        let pinned = Self {
            value: Box::pin(value),
            _token: PinToken::acquire(),
        };
        trace!(addr = ?pinned.as_ptr(), "pinned");
        pinned
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn as_ptr(&self) -> *const T {
        &*self.value as *const T
    }

    pub fn as_mut_ptr(&mut self) -> *mut T {
        // SAFETY: the pointer never moves the value out of the box.
        unsafe { self.value.as_mut().get_unchecked_mut() as *mut T }
    }
}

/// Pin `value` for exactly the duration of `call`.
///
/// The pin is released on every exit path, unwinding included.
pub fn scoped<T, R>(value: T, call: impl FnOnce(*mut T) -> R) -> R {
    let mut pinned = Pinned::new(value);
    call(pinned.as_mut_ptr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_pin_released_after_call() {
        let before = active_pins();
        let seen = scoped(41u32, |ptr| {
            assert_eq!(active_pins(), before + 1);
            unsafe { *ptr + 1 }
        });
        assert_eq!(seen, 42);
        assert_eq!(active_pins(), before);
    }

    #[test]
    fn scoped_pin_released_on_error() {
        let before = active_pins();
        let result: Result<(), &str> = scoped([0u8; 8], |_| Err("native call failed"));
        assert!(result.is_err());
        assert_eq!(active_pins(), before);
    }

    #[test]
    fn scoped_pin_released_on_unwind() {
        let before = active_pins();
        let outcome = std::panic::catch_unwind(|| scoped(1u8, |_| panic!("boom")));
        assert!(outcome.is_err());
        assert_eq!(active_pins(), before);
    }

    #[test]
    fn address_is_stable() {
        let pinned = Pinned::new(vec![1, 2, 3]);
        let addr = pinned.as_ptr();
        let moved = pinned;
        assert_eq!(moved.as_ptr(), addr);
        assert_eq!(moved.get().len(), 3);
    }
}
