//! 与厂商无关的集合通信运行时。
//!
//! 设备运行时和集合通信库分别由 [`DeviceRuntime`] 和 [`CclAdaptor`] 两个适配器约定描述，
//! 进程启动时通过 [`registry`] 选定一对实现，[`Communicator`] 在其上管理通信域的生命周期。

mod common;
mod handle;
mod inproc_node;

pub mod bootstrap;
pub mod ccl;
pub mod comm;
pub mod device;
pub mod registry;

pub use common::*;

#[cfg(any(use_cpu, test))]
pub use handle::{common_cpu, inproc};

pub use ccl::{CclAdaptor, CclFeature, InnerComm};
pub use comm::{CommState, Communicator, Work};
pub use device::{
    DevPtr, DeviceFeature, DeviceProps, DeviceRuntime, Event, MemHandle, MemKind, MemcpyKind,
    Stream,
};
pub use registry::Adaptors;
