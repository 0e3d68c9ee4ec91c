//! <h1 align="center"> elfexec </h1><hr/>
//!
//! Loads ELF executables into an address space and writes ELF core dumps of processes.
//!
//! The operating system pieces both directions depend on (virtual memory, files, register state)
//! are traits in [`kernel`] and [`coredump`]. In-process implementations of them make it possible to
//! build process images and core dumps without a real kernel.

mod logger;

/* elfexec's interface: */
pub mod coredump;
pub mod elf;
pub mod kernel;
pub mod loader;

pub use logger::Logger;
