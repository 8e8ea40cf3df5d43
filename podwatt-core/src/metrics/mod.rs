//! Host metric readers: power domains, per-process counters, I/O and memory.

pub mod acpi;
pub mod ebpf;
pub mod gpu;
pub mod io;
pub mod memory;
pub mod power;
pub mod rapl;
pub mod raw_sample;
