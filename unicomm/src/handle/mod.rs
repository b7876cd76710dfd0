#[cfg(any(use_cpu, test))]
pub mod common_cpu;
#[cfg(any(use_cpu, test))]
pub mod inproc;
