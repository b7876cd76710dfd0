use std::slice::{from_raw_parts, from_raw_parts_mut};

/// 设备运行时分配的存储地址，也可以是主机存储地址。
///
/// 地址本身不携带所有权，存储的生命周期由显式的分配和释放决定。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct DevPtr(*mut u8);

unsafe impl Send for DevPtr {}
unsafe impl Sync for DevPtr {}

impl DevPtr {
    #[inline]
    pub const fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    #[inline]
    pub const fn from_ptr<T>(ptr: *mut T) -> Self {
        Self(ptr.cast())
    }

    /// 主机上的切片作为拷贝的源或目标。
    #[inline]
    pub fn from_host<T>(host: &mut [T]) -> Self {
        Self::from_ptr(host.as_mut_ptr())
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    #[inline]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn byte_add(self, offset: usize) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// # Safety
    ///
    /// 地址必须可以在主机上访问，且在返回的切片存活期间有至少 `len` 字节有效。
    #[inline]
    pub unsafe fn as_slice<'a>(self, len: usize) -> &'a [u8] {
        if len == 0 {
            &[]
        } else {
            from_raw_parts(self.0, len)
        }
    }

    /// # Safety
    ///
    /// 同 [`DevPtr::as_slice`]，并且期间没有其他对这段存储的访问。
    #[inline]
    pub unsafe fn as_slice_mut<'a>(self, len: usize) -> &'a mut [u8] {
        if len == 0 {
            &mut []
        } else {
            from_raw_parts_mut(self.0, len)
        }
    }
}

#[test]
fn test_offset() {
    let mut buf = [1u32, 2, 3, 4];
    let ptr = DevPtr::from_host(&mut buf);
    assert!(!ptr.is_null());
    assert!(DevPtr::null().is_null());
    assert_eq!(ptr.byte_add(8).addr(), ptr.addr() + 8);
    let bytes = unsafe { ptr.byte_add(4).as_slice(4) };
    assert_eq!(bytes, 2u32.to_ne_bytes());
}
