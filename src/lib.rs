//! Harness core for kernel conformance test programs.
//!
//! A test program is a [`TestDescriptor`](test::TestDescriptor) registered with
//! [`inventory`], whose [`TestProgram`](test::TestProgram) body is run by the
//! [`Driver`](driver::Driver) for every case and variant. Bodies check syscall
//! results with the `expect_*!` macros, which report through the
//! [`Reporter`](result::Reporter).

#[macro_use]
mod macros;

pub mod config;
pub mod context;
pub mod driver;
pub mod errno;
pub mod expect;
pub mod features;
pub mod pgsize;
pub mod result;
pub mod utils;
