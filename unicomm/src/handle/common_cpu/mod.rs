//! 以主机存储模拟设备、以工作线程模拟任务队列的设备运行时。

mod event;
mod memory;
mod stream;

pub use event::CpuEvent;
pub use stream::{CpuStream, Job};

use crate::{
    device::{
        DeviceFeature, DeviceProps, DeviceRuntime, Event, HostFn, MemHandle, MemKind, MemcpyKind,
        Stream,
    },
    invalid_argument, not_supported, unhandled_device_error, DevPtr, Progress, Result,
};
use memory::Arena;
use std::{
    cell::Cell,
    ptr::{copy, write_bytes},
    sync::{Mutex, Weak},
};
use stream::StreamState;

thread_local! {
    static CURRENT: Cell<usize> = const { Cell::new(0) };
}

/// 调用线程的当前设备。
#[inline]
pub(crate) fn current_device() -> usize {
    CURRENT.get()
}

#[derive(Clone, Debug)]
pub struct Config {
    pub device_count: usize,
    pub managed_memory: bool,
    pub gdr: bool,
    pub host_func: bool,
    pub stream_ordered_alloc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_count: 1,
            managed_memory: true,
            gdr: true,
            host_func: true,
            stream_ordered_alloc: true,
        }
    }
}

pub struct Cpu {
    config: Config,
    arena: Arena,
    streams: Mutex<Vec<Weak<StreamState>>>,
}

struct CpuMemHandle {
    device: usize,
}

impl Default for Cpu {
    #[inline]
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Cpu {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            arena: Arena::default(),
            streams: Default::default(),
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 仍未释放的存储区域数量。
    #[inline]
    pub fn live_regions(&self) -> usize {
        self.arena.len()
    }

    fn check_device(&self, dev: usize) -> Result<()> {
        if dev < self.config.device_count {
            Ok(())
        } else {
            Err(invalid_argument(format!(
                "device {dev} out of range, {} devices",
                self.config.device_count
            )))
        }
    }

    fn gdr_handle(&self, handle: &MemHandle) -> Result<usize> {
        if !self.config.gdr {
            return Err(not_supported("gdr is disabled"));
        }
        Ok(handle.native::<CpuMemHandle>()?.device)
    }
}

/// 在有任务队列时把操作排入队列，否则立即执行。
fn run_on(stream: Option<&Stream>, f: impl FnOnce() + Send + 'static) -> Result<()> {
    match stream {
        Some(stream) => stream
            .native::<CpuStream>()?
            .enqueue(Box::new(move || {
                f();
                Ok(())
            }))
            .map(drop),
        None => {
            f();
            Ok(())
        }
    }
}

impl DeviceRuntime for Cpu {
    #[inline]
    fn name(&self) -> &'static str {
        "common-cpu"
    }

    #[inline]
    fn vendor(&self) -> &'static str {
        "CPU"
    }

    fn supports(&self, feature: DeviceFeature) -> bool {
        match feature {
            DeviceFeature::ManagedMemory => self.config.managed_memory,
            DeviceFeature::Gdr | DeviceFeature::HostShareMemory => self.config.gdr,
            DeviceFeature::HostFunc => self.config.host_func,
            DeviceFeature::StreamOrderedAlloc => self.config.stream_ordered_alloc,
        }
    }

    fn device_synchronize(&self) -> Result<()> {
        let streams = {
            let mut streams = self.streams.lock().unwrap();
            streams.retain(|s| s.strong_count() > 0);
            streams.iter().filter_map(Weak::upgrade).collect::<Vec<_>>()
        };
        streams.iter().try_for_each(|s| s.synchronize())
    }

    fn set_device(&self, dev: usize) -> Result<()> {
        self.check_device(dev)?;
        CURRENT.set(dev);
        Ok(())
    }

    #[inline]
    fn get_device(&self) -> Result<usize> {
        Ok(current_device())
    }

    #[inline]
    fn get_device_count(&self) -> Result<usize> {
        Ok(self.config.device_count)
    }

    fn device_malloc(
        &self,
        size: usize,
        kind: MemKind,
        stream: Option<&Stream>,
    ) -> Result<DevPtr> {
        match kind {
            MemKind::Managed if !self.config.managed_memory => {
                return Err(unhandled_device_error("managed memory is not supported"))
            }
            MemKind::GdrCapable if !self.config.gdr => {
                return Err(unhandled_device_error("gdr memory is not supported"))
            }
            _ => {}
        }
        if let Some(stream) = stream {
            // 分配立即生效，对排在队列上的后续任务同样可见
            stream.native::<CpuStream>()?;
        }
        let ptr = self.arena.alloc(size, kind, current_device())?;
        log::trace!("malloc {size} bytes {kind:?} at {ptr:?}");
        Ok(ptr)
    }

    fn device_free(&self, ptr: DevPtr, kind: MemKind, stream: Option<&Stream>) -> Result<()> {
        let region = self.arena.detach(ptr, kind)?;
        log::trace!("free {kind:?} at {ptr:?}");
        match stream {
            Some(stream) if kind != MemKind::Host && self.config.stream_ordered_alloc => {
                run_on(Some(stream), move || region.release())
            }
            _ => {
                region.release();
                Ok(())
            }
        }
    }

    fn device_memcpy(
        &self,
        dst: DevPtr,
        src: DevPtr,
        size: usize,
        kind: MemcpyKind,
        stream: Option<&Stream>,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if dst.is_null() || src.is_null() {
            return Err(invalid_argument(format!("memcpy {kind:?} with null pointer")));
        }
        run_on(stream, move || unsafe {
            copy(src.as_ptr().cast_const(), dst.as_ptr(), size)
        })
    }

    fn device_memset(
        &self,
        ptr: DevPtr,
        value: u8,
        size: usize,
        kind: MemKind,
        stream: Option<&Stream>,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if ptr.is_null() {
            return Err(invalid_argument("memset null pointer"));
        }
        let stream = if kind == MemKind::Host { None } else { stream };
        run_on(stream, move || unsafe { write_bytes(ptr.as_ptr(), value, size) })
    }

    fn mem_handle_init(&self, dev: usize) -> Result<MemHandle> {
        if !self.config.gdr {
            return Err(not_supported("gdr is disabled"));
        }
        self.check_device(dev)?;
        Ok(MemHandle::new(CpuMemHandle { device: dev }))
    }

    fn mem_handle_destroy(&self, dev: usize, handle: MemHandle) -> Result<()> {
        let device = self.gdr_handle(&handle)?;
        if device != dev {
            return Err(invalid_argument(format!(
                "mem handle of device {device} destroyed on device {dev}"
            )));
        }
        Ok(())
    }

    fn gdr_mem_alloc(&self, size: usize, handle: &MemHandle) -> Result<DevPtr> {
        let device = self.gdr_handle(handle)?;
        self.arena.alloc(size, MemKind::GdrCapable, device)
    }

    fn gdr_mem_free(&self, ptr: DevPtr, handle: &MemHandle) -> Result<()> {
        self.gdr_handle(handle)?;
        if ptr.is_null() {
            return Ok(());
        }
        self.arena.detach(ptr, MemKind::GdrCapable)?.release();
        Ok(())
    }

    fn host_share_mem_alloc(&self, size: usize, handle: &MemHandle) -> Result<DevPtr> {
        let device = self.gdr_handle(handle)?;
        self.arena.alloc(size, MemKind::Host, device)
    }

    fn host_share_mem_free(&self, ptr: DevPtr, handle: &MemHandle) -> Result<()> {
        self.gdr_handle(handle)?;
        if ptr.is_null() {
            return Ok(());
        }
        self.arena.detach(ptr, MemKind::Host)?.release();
        Ok(())
    }

    fn stream_create(&self) -> Result<Stream> {
        let stream = CpuStream::new(current_device())?;
        let mut streams = self.streams.lock().unwrap();
        streams.retain(|s| s.strong_count() > 0);
        streams.push(std::sync::Arc::downgrade(stream.state()));
        Ok(Stream::new(stream))
    }

    fn stream_destroy(&self, stream: Stream) -> Result<()> {
        stream.native::<CpuStream>()?.retire()
    }

    #[inline]
    fn stream_synchronize(&self, stream: &Stream) -> Result<()> {
        stream.native::<CpuStream>()?.state().synchronize()
    }

    #[inline]
    fn stream_query(&self, stream: &Stream) -> Result<Progress> {
        stream.native::<CpuStream>()?.state().query()
    }

    fn stream_wait_event(&self, stream: &Stream, event: &Event) -> Result<()> {
        let stream = stream.native::<CpuStream>()?;
        match event.native::<CpuEvent>()?.mark() {
            Some(mark) => stream
                .enqueue(Box::new(move || {
                    mark.wait();
                    Ok(())
                }))
                .map(drop),
            None => Ok(()),
        }
    }

    #[inline]
    fn event_create(&self) -> Result<Event> {
        Ok(Event::new(CpuEvent::default()))
    }

    fn event_destroy(&self, event: Event) -> Result<()> {
        event.native::<CpuEvent>()?;
        Ok(())
    }

    fn event_record(&self, event: &Event, stream: &Stream) -> Result<()> {
        event
            .native::<CpuEvent>()?
            .record(stream.native::<CpuStream>()?);
        Ok(())
    }

    #[inline]
    fn event_synchronize(&self, event: &Event) -> Result<()> {
        event.native::<CpuEvent>()?.synchronize()
    }

    #[inline]
    fn event_query(&self, event: &Event) -> Result<Progress> {
        event.native::<CpuEvent>()?.query()
    }

    fn launch_host_func(&self, stream: &Stream, f: HostFn) -> Result<()> {
        if !self.config.host_func {
            return Err(not_supported("host function launch is disabled"));
        }
        stream
            .native::<CpuStream>()?
            .enqueue(Box::new(move || {
                f();
                Ok(())
            }))
            .map(drop)
    }

    fn get_device_properties(&self, dev: usize) -> Result<DeviceProps> {
        self.check_device(dev)?;
        Ok(DeviceProps {
            name: format!("common-cpu:{dev}"),
            pci_bus_id: dev as u32 + 1,
            pci_device_id: 0,
            pci_domain_id: 0,
            gdr_supported: self.config.gdr,
        })
    }
}

#[cfg(test)]
mod test {
    use super::{Config, Cpu};
    use crate::{
        device::{DeviceFeature, DeviceRuntime, MemKind, MemcpyKind},
        DevPtr, ErrorKind, Progress,
    };
    use std::{
        mem::size_of,
        sync::{
            atomic::{AtomicBool, Ordering::SeqCst},
            mpsc::channel,
            Arc,
        },
        thread,
        time::Duration,
    };

    #[test]
    fn test_malloc_free() {
        let cpu = Cpu::default();
        let stream = cpu.stream_create().unwrap();
        for kind in [MemKind::Host, MemKind::Device, MemKind::Managed, MemKind::GdrCapable] {
            let ptr = cpu.device_malloc(100, kind, None).unwrap();
            assert!(!ptr.is_null());
            cpu.device_free(ptr, kind, None).unwrap();

            let ptr = cpu.device_malloc(100, kind, Some(&stream)).unwrap();
            cpu.device_free(ptr, kind, Some(&stream)).unwrap();
        }
        cpu.stream_synchronize(&stream).unwrap();
        assert_eq!(cpu.live_regions(), 0);

        let a = cpu.device_malloc(8, MemKind::Device, None).unwrap();
        let b = cpu.device_malloc(8, MemKind::Device, None).unwrap();
        cpu.device_memset(b, 7, 8, MemKind::Device, None).unwrap();
        cpu.device_free(a, MemKind::Device, None).unwrap();
        let e = cpu.device_free(a, MemKind::Device, None).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidArgument);
        let e = cpu.device_free(b, MemKind::Host, None).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidArgument);

        assert_eq!(unsafe { b.as_slice(8) }, [7; 8]);
        cpu.device_free(b, MemKind::Device, None).unwrap();
        assert_eq!(cpu.live_regions(), 0);
        cpu.stream_destroy(stream).unwrap();
    }

    #[test]
    fn test_capability() {
        let cpu = Cpu::new(Config {
            managed_memory: false,
            gdr: false,
            host_func: false,
            ..Config::default()
        });
        assert!(!cpu.supports(DeviceFeature::ManagedMemory));
        assert!(!cpu.supports(DeviceFeature::Gdr));
        assert!(cpu.supports(DeviceFeature::StreamOrderedAlloc));

        for kind in [MemKind::Managed, MemKind::GdrCapable] {
            let e = cpu.device_malloc(16, kind, None).unwrap_err();
            assert_eq!(e.kind, ErrorKind::UnhandledDeviceError);
        }
        assert_eq!(cpu.mem_handle_init(0).unwrap_err().kind, ErrorKind::NotSupported);

        let stream = cpu.stream_create().unwrap();
        let e = cpu.launch_host_func(&stream, Box::new(|| {})).unwrap_err();
        assert_eq!(e.kind, ErrorKind::NotSupported);
        assert!(!cpu.get_device_properties(0).unwrap().gdr_supported);
    }

    #[test]
    fn test_host_func_ordering() {
        const N: usize = 1 << 16;

        let cpu = Arc::new(Cpu::default());
        let stream = cpu.stream_create().unwrap();
        let mut a = (0..N as u32).collect::<Vec<_>>();
        let mut c = vec![0u32; N];
        let size = N * size_of::<u32>();
        let b = cpu.device_malloc(size, MemKind::Device, None).unwrap();

        let observed = Arc::new(AtomicBool::new(false));
        cpu.device_memcpy(
            b,
            DevPtr::from_host(&mut a),
            size,
            MemcpyKind::HostToDevice,
            Some(&stream),
        )
        .unwrap();
        {
            let observed = observed.clone();
            cpu.launch_host_func(
                &stream,
                Box::new(move || {
                    let b = unsafe { std::slice::from_raw_parts_mut(b.as_ptr().cast::<u32>(), N) };
                    let full = b.iter().enumerate().all(|(i, &x)| x == i as u32);
                    thread::sleep(Duration::from_millis(20));
                    b[N - 1] = u32::MAX;
                    observed.store(full, SeqCst)
                }),
            )
            .unwrap();
        }
        cpu.device_memcpy(
            DevPtr::from_host(&mut c),
            b,
            size,
            MemcpyKind::DeviceToHost,
            Some(&stream),
        )
        .unwrap();
        cpu.stream_synchronize(&stream).unwrap();

        assert!(observed.load(SeqCst));
        assert_eq!(c[..N - 1], a[..N - 1]);
        assert_eq!(c[N - 1], u32::MAX);
        cpu.device_free(b, MemKind::Device, None).unwrap();
    }

    #[test]
    fn test_events() {
        let cpu = Cpu::default();
        let s1 = cpu.stream_create().unwrap();
        let s2 = cpu.stream_create().unwrap();
        let event = cpu.event_create().unwrap();

        cpu.event_synchronize(&event).unwrap();
        assert_eq!(cpu.event_query(&event).unwrap(), Progress::Complete);

        let flag = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicBool::new(false));
        {
            let flag = flag.clone();
            cpu.launch_host_func(
                &s1,
                Box::new(move || {
                    thread::sleep(Duration::from_millis(50));
                    flag.store(true, SeqCst)
                }),
            )
            .unwrap();
        }
        cpu.event_record(&event, &s1).unwrap();
        cpu.stream_wait_event(&s2, &event).unwrap();
        {
            let flag = flag.clone();
            let seen = seen.clone();
            cpu.launch_host_func(&s2, Box::new(move || seen.store(flag.load(SeqCst), SeqCst)))
                .unwrap();
        }
        cpu.stream_synchronize(&s2).unwrap();
        assert!(seen.load(SeqCst));
        assert_eq!(cpu.event_query(&event).unwrap(), Progress::Complete);
        assert_eq!(cpu.stream_query(&s1).unwrap(), Progress::Complete);

        cpu.device_synchronize().unwrap();
        cpu.event_destroy(event).unwrap();
        cpu.stream_destroy(s1).unwrap();
        cpu.stream_destroy(s2).unwrap();
    }

    #[test]
    fn test_devices() {
        let cpu = Cpu::new(Config {
            device_count: 2,
            ..Config::default()
        });
        assert_eq!(cpu.get_device_count().unwrap(), 2);
        assert_eq!(cpu.set_device(2).unwrap_err().kind, ErrorKind::InvalidArgument);
        cpu.set_device(1).unwrap();
        assert_eq!(cpu.get_device().unwrap(), 1);

        let props = cpu.get_device_properties(1).unwrap();
        assert_eq!(props.name, "common-cpu:1");
        let bus_id = cpu.get_device_pci_bus_id(1).unwrap();
        assert_eq!(bus_id, "0000:02:00.0");
        assert_eq!(cpu.get_device_by_pci_bus_id(&bus_id).unwrap(), 1);
        assert_eq!(cpu.get_device_by_pci_bus_id("0000:01:00.0").unwrap(), 0);
        let e = cpu.get_device_by_pci_bus_id("0000:09:00.0").unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_query() {
        let cpu = Cpu::default();
        let stream = cpu.stream_create().unwrap();
        let event = cpu.event_create().unwrap();

        let (open, gate) = channel::<()>();
        cpu.launch_host_func(
            &stream,
            Box::new(move || {
                let _ = gate.recv();
            }),
        )
        .unwrap();
        cpu.event_record(&event, &stream).unwrap();
        assert_eq!(cpu.stream_query(&stream).unwrap(), Progress::InProgress);
        assert_eq!(cpu.event_query(&event).unwrap(), Progress::InProgress);

        open.send(()).unwrap();
        cpu.event_synchronize(&event).unwrap();
        assert_eq!(cpu.event_query(&event).unwrap(), Progress::Complete);
        cpu.stream_synchronize(&stream).unwrap();
        assert_eq!(cpu.stream_query(&stream).unwrap(), Progress::Complete);
    }

    #[test]
    fn test_stream_released_by_own_job() {
        let cpu = Arc::new(Cpu::default());
        let stream = cpu.stream_create().unwrap();
        let held = stream.clone();
        let (open, gate) = channel::<()>();
        cpu.launch_host_func(
            &stream,
            Box::new(move || {
                let _ = gate.recv();
                drop(held)
            }),
        )
        .unwrap();
        // 最后一个引用在工作线程的任务里释放
        drop(stream);
        open.send(()).unwrap();

        let (done, wait) = channel();
        {
            let cpu = cpu.clone();
            thread::spawn(move || done.send(cpu.device_synchronize()).unwrap());
        }
        wait.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    }

    #[test]
    fn test_stream_list() {
        let cpu = Cpu::default();
        for _ in 0..8 {
            let stream = cpu.stream_create().unwrap();
            cpu.stream_destroy(stream).unwrap();
        }
        let _live = cpu.stream_create().unwrap();
        assert_eq!(cpu.streams.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_gdr() {
        let cpu = Cpu::new(Config {
            device_count: 2,
            ..Config::default()
        });
        let handle = cpu.mem_handle_init(1).unwrap();
        let gdr = cpu.gdr_mem_alloc(64, &handle).unwrap();
        let shared = cpu.host_share_mem_alloc(64, &handle).unwrap();
        assert_eq!(cpu.live_regions(), 2);
        cpu.gdr_mem_free(gdr, &handle).unwrap();
        cpu.host_share_mem_free(shared, &handle).unwrap();
        assert_eq!(cpu.live_regions(), 0);

        let other = cpu.mem_handle_init(0).unwrap();
        let e = cpu.mem_handle_destroy(1, other).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidArgument);
        cpu.mem_handle_destroy(1, handle).unwrap();
    }

    #[test]
    fn test_memset_ordered() {
        let cpu = Cpu::default();
        let stream = cpu.stream_create().unwrap();
        let ptr = cpu.device_malloc(16, MemKind::Device, Some(&stream)).unwrap();
        let mut host = [0u8; 16];
        cpu.device_memset(ptr, 0xab, 16, MemKind::Device, Some(&stream))
            .unwrap();
        cpu.device_memcpy(
            DevPtr::from_host(&mut host),
            ptr,
            16,
            MemcpyKind::DeviceToHost,
            Some(&stream),
        )
        .unwrap();
        cpu.device_free(ptr, MemKind::Device, Some(&stream)).unwrap();
        cpu.stream_synchronize(&stream).unwrap();
        assert_eq!(host, [0xab; 16]);

        let e = cpu
            .device_memcpy(
                DevPtr::null(),
                DevPtr::from_host(&mut host),
                1,
                MemcpyKind::HostToDevice,
                None,
            )
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidArgument);

        cpu.stream_destroy(stream.clone()).unwrap();
        let e = cpu
            .device_memset(ptr, 0, 1, MemKind::Device, Some(&stream))
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidUsage);
    }
}
