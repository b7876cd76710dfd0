//! 设备运行时抽象。

mod ptr;

pub use ptr::DevPtr;

use crate::{common::opaque, invalid_argument, not_supported, Progress, Result};

/// 存储区域的类型。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemKind {
    Host,
    Device,
    Managed,
    GdrCapable,
}

/// 拷贝方向。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemcpyKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

/// 可选的设备运行时能力。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DeviceFeature {
    ManagedMemory,
    Gdr,
    HostShareMemory,
    HostFunc,
    /// 分配和释放可以排在任务队列上异步执行。
    StreamOrderedAlloc,
}

opaque! {
    /// 设备任务队列。克隆得到的是对同一个队列的引用。
    #[derive(Clone)]
    pub struct Stream;
}

opaque! {
    /// 任务队列上的时间点标记。
    pub struct Event;
}

opaque! {
    /// 一个设备上 GPU-direct RDMA 注册的句柄。
    pub struct MemHandle;
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DeviceProps {
    pub name: String,
    pub pci_bus_id: u32,
    pub pci_device_id: u32,
    pub pci_domain_id: u32,
    pub gdr_supported: bool,
}

impl DeviceProps {
    /// `dddd:bb:dd.0` 格式的 PCI 总线标识。
    pub fn bus_id_string(&self) -> String {
        format!(
            "{:04x}:{:02x}:{:02x}.0",
            self.pci_domain_id, self.pci_bus_id, self.pci_device_id
        )
    }
}

/// 排在任务队列上的主机函数。
pub type HostFn = Box<dyn FnOnce() + Send + 'static>;

/// 设备运行时适配器。
///
/// 每个厂商的设备运行时实现一次，进程启动时由注册表选定一个实现。
/// 所有带 [`Stream`] 参数的操作只负责提交，完成情况要通过任务队列或事件同步观察。
/// 不带任务队列参数的操作是同步的。
///
/// 可选能力（GDR、主机函数、托管内存）通过 [`DeviceRuntime::supports`] 查询，
/// 不支持的入口统一返回 [`NotSupported`](crate::ErrorKind::NotSupported)。
pub trait DeviceRuntime: Send + Sync {
    /// 适配器名字。
    fn name(&self) -> &'static str;
    /// 硬件厂商名字。
    fn vendor(&self) -> &'static str;
    /// 查询可选能力。
    fn supports(&self, feature: DeviceFeature) -> bool;

    /// 等待这个运行时上所有任务队列清空。
    fn device_synchronize(&self) -> Result<()>;
    /// 设置调用线程的当前设备，必须在该设备上分配存储或创建任务队列之前调用。
    fn set_device(&self, dev: usize) -> Result<()>;
    fn get_device(&self) -> Result<usize>;
    fn get_device_count(&self) -> Result<usize>;

    /// 分配存储。
    ///
    /// 只有支持 [`DeviceFeature::StreamOrderedAlloc`] 的运行时会把分配排在 `stream` 上，
    /// 其他运行时忽略 `stream` 并同步分配。
    fn device_malloc(&self, size: usize, kind: MemKind, stream: Option<&Stream>)
        -> Result<DevPtr>;
    /// 释放存储。`kind` 必须与分配时一致。
    fn device_free(&self, ptr: DevPtr, kind: MemKind, stream: Option<&Stream>) -> Result<()>;
    fn device_memcpy(
        &self,
        dst: DevPtr,
        src: DevPtr,
        size: usize,
        kind: MemcpyKind,
        stream: Option<&Stream>,
    ) -> Result<()>;
    fn device_memset(
        &self,
        ptr: DevPtr,
        value: u8,
        size: usize,
        kind: MemKind,
        stream: Option<&Stream>,
    ) -> Result<()>;

    fn mem_handle_init(&self, _dev: usize) -> Result<MemHandle> {
        Err(not_supported(format!("{}: mem_handle_init", self.name())))
    }
    fn mem_handle_destroy(&self, _dev: usize, _handle: MemHandle) -> Result<()> {
        Err(not_supported(format!("{}: mem_handle_destroy", self.name())))
    }
    fn gdr_mem_alloc(&self, _size: usize, _handle: &MemHandle) -> Result<DevPtr> {
        Err(not_supported(format!("{}: gdr_mem_alloc", self.name())))
    }
    fn gdr_mem_free(&self, _ptr: DevPtr, _handle: &MemHandle) -> Result<()> {
        Err(not_supported(format!("{}: gdr_mem_free", self.name())))
    }
    fn host_share_mem_alloc(&self, _size: usize, _handle: &MemHandle) -> Result<DevPtr> {
        Err(not_supported(format!("{}: host_share_mem_alloc", self.name())))
    }
    fn host_share_mem_free(&self, _ptr: DevPtr, _handle: &MemHandle) -> Result<()> {
        Err(not_supported(format!("{}: host_share_mem_free", self.name())))
    }

    fn stream_create(&self) -> Result<Stream>;
    /// 等待任务队列清空并回收。其他克隆的句柄此后不能再提交任务。
    fn stream_destroy(&self, stream: Stream) -> Result<()>;
    fn stream_synchronize(&self, stream: &Stream) -> Result<()>;
    /// 非阻塞地查询任务队列是否清空。
    fn stream_query(&self, stream: &Stream) -> Result<Progress>;
    /// 让 `stream` 上之后的任务等待 `event` 完成，不阻塞主机线程。
    fn stream_wait_event(&self, stream: &Stream, event: &Event) -> Result<()>;

    fn event_create(&self) -> Result<Event>;
    fn event_destroy(&self, event: Event) -> Result<()>;
    fn event_record(&self, event: &Event, stream: &Stream) -> Result<()>;
    fn event_synchronize(&self, event: &Event) -> Result<()>;
    fn event_query(&self, event: &Event) -> Result<Progress>;

    /// 在任务队列上排入主机函数。
    ///
    /// `f` 在之前提交的任务全部完成之后才执行，之后提交的任务在 `f` 返回之前不会开始。
    fn launch_host_func(&self, _stream: &Stream, _f: HostFn) -> Result<()> {
        Err(not_supported(format!("{}: launch_host_func", self.name())))
    }

    fn get_device_properties(&self, dev: usize) -> Result<DeviceProps>;
    fn get_device_pci_bus_id(&self, dev: usize) -> Result<String> {
        self.get_device_properties(dev)
            .map(|props| props.bus_id_string())
    }
    fn get_device_by_pci_bus_id(&self, bus_id: &str) -> Result<usize> {
        let bus_id = bus_id.trim().to_ascii_lowercase();
        for dev in 0..self.get_device_count()? {
            if self.get_device_pci_bus_id(dev)? == bus_id {
                return Ok(dev);
            }
        }
        Err(invalid_argument(format!("no device at {bus_id}")))
    }
}
