//! 编译期确定的适配器表，进程启动时选定一项。

use crate::{
    ccl::CclAdaptor, device::DeviceRuntime, invalid_argument, invalid_usage, not_supported, Config,
    Result,
};
use std::sync::{Arc, OnceLock};

/// 一对配套的设备运行时和集合通信库。
#[derive(Clone)]
pub struct Adaptors {
    pub device: Arc<dyn DeviceRuntime>,
    pub ccl: Arc<dyn CclAdaptor>,
}

impl Adaptors {
    #[inline]
    pub fn new(device: Arc<dyn DeviceRuntime>, ccl: Arc<dyn CclAdaptor>) -> Self {
        Self { device, ccl }
    }
}

struct Entry {
    name: &'static str,
    build: fn() -> Adaptors,
}

const ENTRIES: &[Entry] = &[
    #[cfg(use_cpu)]
    Entry {
        name: "cpu",
        build: cpu::native,
    },
    #[cfg(use_cpu)]
    Entry {
        name: "cpu-p2p",
        build: cpu::p2p_only,
    },
];

#[cfg(use_cpu)]
mod cpu {
    use super::Adaptors;
    use crate::{common_cpu::Cpu, inproc::Inproc};
    use std::sync::Arc;

    pub(super) fn native() -> Adaptors {
        Adaptors::new(Arc::new(Cpu::default()), Arc::new(Inproc::new()))
    }

    pub(super) fn p2p_only() -> Adaptors {
        Adaptors::new(Arc::new(Cpu::default()), Arc::new(Inproc::p2p_only()))
    }
}

static SELECTED: OnceLock<(&'static str, Adaptors)> = OnceLock::new();

/// 编译进来的所有适配器名字。
pub fn names() -> Vec<&'static str> {
    ENTRIES.iter().map(|e| e.name).collect()
}

/// 构造一份新的适配器，不影响进程的选择。
pub fn create(name: &str) -> Result<Adaptors> {
    find(name).map(|e| (e.build)())
}

/// 选定进程使用的适配器。重复选择同一项返回同一份实例，选择其他项是错误。
pub fn select(name: &str) -> Result<Adaptors> {
    let entry = find(name)?;
    let (selected, adaptors) = SELECTED.get_or_init(|| {
        log::info!("select adaptor {}", entry.name);
        (entry.name, (entry.build)())
    });
    if *selected == entry.name {
        Ok(adaptors.clone())
    } else {
        Err(invalid_usage(format!(
            "adaptor {selected} is already selected, cannot select {name}"
        )))
    }
}

/// 进程选定的适配器。还没有选择时按环境变量或编译顺序选择。
pub fn get() -> Result<Adaptors> {
    if let Some((_, adaptors)) = SELECTED.get() {
        return Ok(adaptors.clone());
    }
    match Config::from_env().adaptor {
        Some(name) => select(&name),
        None => match ENTRIES.first() {
            Some(entry) => select(entry.name),
            None => Err(not_supported("no adaptor is compiled in")),
        },
    }
}

fn find(name: &str) -> Result<&'static Entry> {
    ENTRIES
        .iter()
        .find(|e| e.name == name)
        .ok_or_else(|| {
            invalid_argument(format!(
                "unknown adaptor {name}, available: {:?}",
                names()
            ))
        })
}

#[cfg(use_cpu)]
#[test]
fn test_select() {
    assert_eq!(names(), ["cpu", "cpu-p2p"]);
    assert_eq!(
        create("gpu").err().unwrap().kind,
        crate::ErrorKind::InvalidArgument
    );
    let p2p = create("cpu-p2p").unwrap();
    assert_eq!(p2p.ccl.name(), "inproc-p2p");
    assert_eq!(p2p.device.vendor(), "CPU");

    let a = select("cpu").unwrap();
    let b = get().unwrap();
    assert!(Arc::ptr_eq(&a.ccl, &b.ccl));
    assert_eq!(
        select("cpu-p2p").err().unwrap().kind,
        crate::ErrorKind::InvalidUsage
    );
    assert_eq!(
        select("none").err().unwrap().kind,
        crate::ErrorKind::InvalidArgument
    );
}
