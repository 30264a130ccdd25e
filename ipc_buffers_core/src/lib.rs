//! Page-backed buffer allocation for inter-process communication, and an exhaustive self-test
//! for allocators of that kind.
#![no_std]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(all(test, not(target_os = "none")))]
#[macro_use]
extern crate std;

pub mod memory;
pub mod selftest;
