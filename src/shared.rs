// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A home for the `UsbDevice` that both `main` and the USB interrupt can
//! reach.
//!
//! The driver itself never locks anything; it assumes whoever calls it has
//! exclusive access. On a single-core part the easy way to guarantee that is
//! to keep the device in a `static Shared<...>` and only touch it with
//! interrupts masked:
//!
//! ```ignore
//! static USB: Shared<UsbDevice<'static, Mmio, NoHooks>> = Shared::empty();
//!
//! #[interrupt]
//! fn USB() {
//!     USB.with(|dev| dev.on_interrupt());
//! }
//! ```

use core::cell::RefCell;

use cortex_m::interrupt::{self, CriticalSection, Mutex};

pub struct Shared<T>(Mutex<RefCell<Option<T>>>);

impl<T> Shared<T> {
    pub const fn empty() -> Self {
        Self(Mutex::new(RefCell::new(None)))
    }

    /// Stores `value`, returning whatever was there before.
    pub fn put(&self, value: T) -> Option<T> {
        interrupt::free(|cs| self.put_in(cs, value))
    }

    /// Runs `body` on the value with interrupts masked. Returns `None` if
    /// nothing has been stored yet, or if this is a nested call from inside
    /// another `with`.
    pub fn with<U>(&self, body: impl FnOnce(&mut T) -> U) -> Option<U> {
        interrupt::free(|cs| self.with_in(cs, body))
    }

    /// `put` for callers already inside a critical section.
    ///
    /// # Panics
    ///
    /// If called from inside `with` on the same `Shared`.
    pub fn put_in(&self, cs: &CriticalSection, value: T) -> Option<T> {
        self.0.borrow(cs).replace(Some(value))
    }

    /// `with` for callers already inside a critical section.
    pub fn with_in<U>(
        &self,
        cs: &CriticalSection,
        body: impl FnOnce(&mut T) -> U,
    ) -> Option<U> {
        let mut slot = self.0.borrow(cs).try_borrow_mut().ok()?;
        slot.as_mut().map(body)
    }
}
