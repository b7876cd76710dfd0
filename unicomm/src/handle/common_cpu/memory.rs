use crate::{device::MemKind, invalid_argument, system_error, DevPtr, Result};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    collections::HashMap,
    sync::Mutex,
};

const ALIGNMENT: usize = 256;

struct Region {
    layout: Layout,
    kind: MemKind,
    device: usize,
}

/// 记录所有分配出去的存储区域，释放时按地址核对。
#[derive(Default)]
pub(super) struct Arena(Mutex<HashMap<usize, Region>>);

/// 已经从记录中摘下、等待归还给系统的存储区域。
pub(super) struct Detached(DevPtr, Layout);

impl Detached {
    #[inline]
    pub fn release(self) {
        let Self(ptr, layout) = self;
        unsafe { dealloc(ptr.as_ptr(), layout) }
    }
}

impl Arena {
    pub fn alloc(&self, size: usize, kind: MemKind, device: usize) -> Result<DevPtr> {
        let layout = Layout::from_size_align(size.max(1), ALIGNMENT)
            .map_err(|e| invalid_argument(format!("malloc {size} bytes: {e}")))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(system_error(format!("out of memory: {size} bytes")));
        }
        let ptr = DevPtr::from_ptr(ptr);
        let _ = self.0.lock().unwrap().insert(
            ptr.addr(),
            Region {
                layout,
                kind,
                device,
            },
        );
        Ok(ptr)
    }

    /// 摘下一块存储。未知地址或类型不符的释放被拒绝，不影响其他区域。
    pub fn detach(&self, ptr: DevPtr, kind: MemKind) -> Result<Detached> {
        let mut table = self.0.lock().unwrap();
        match table.get(&ptr.addr()).map(|region| region.kind) {
            Some(found) if found == kind => {
                let region = table.remove(&ptr.addr()).unwrap();
                Ok(Detached(ptr, region.layout))
            }
            Some(found) => Err(invalid_argument(format!(
                "{ptr:?} is {found:?} memory, freed as {kind:?}"
            ))),
            None => Err(invalid_argument(format!(
                "{ptr:?} is not allocated by this runtime"
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let table = self.0.get_mut().unwrap();
        for (addr, region) in table.drain() {
            log::warn!(
                "{:?} memory of {} bytes on device {} leaked at shutdown",
                region.kind,
                region.layout.size(),
                region.device
            );
            unsafe { dealloc(addr as *mut u8, region.layout) }
        }
    }
}

#[test]
fn test_double_free() {
    let arena = Arena::default();
    let a = arena.alloc(64, MemKind::Device, 0).unwrap();
    let b = arena.alloc(0, MemKind::Host, 0).unwrap();
    assert_eq!(arena.len(), 2);

    assert!(arena.detach(a, MemKind::Host).is_err());
    arena.detach(a, MemKind::Device).unwrap().release();
    assert!(arena.detach(a, MemKind::Device).is_err());

    assert_eq!(arena.len(), 1);
    arena.detach(b, MemKind::Host).unwrap().release();
    assert_eq!(arena.len(), 0);
}
