use super::{invalid_argument, Result};
use rand::Rng;
use std::fmt;

/// 唯一标识的字节数。
pub const UNIQUE_ID_BYTES: usize = 128;

/// 通信域的汇合令牌。
///
/// 由 0 号进程选中的通信库生成，在任何进程初始化通信域之前分发到所有进程。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct UniqueId([u8; UNIQUE_ID_BYTES]);

impl Default for UniqueId {
    #[inline]
    fn default() -> Self {
        Self([0; UNIQUE_ID_BYTES])
    }
}

impl UniqueId {
    pub fn random() -> Self {
        let mut bytes = [0; UNIQUE_ID_BYTES];
        rand::thread_rng().fill(&mut bytes[..]);
        // a valid id is never all zero
        bytes[0] |= 1;
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let Ok(bytes) = <[u8; UNIQUE_ID_BYTES]>::try_from(bytes) else {
            return Err(invalid_argument(format!(
                "unique id is {} bytes, {UNIQUE_ID_BYTES} expected",
                bytes.len()
            )));
        };
        let ans = Self(bytes);
        ans.check()?;
        Ok(ans)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_empty() {
            Err(invalid_argument("unique id is empty"))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UniqueId(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

#[test]
fn test_unique_id() {
    let id = UniqueId::random();
    assert!(!id.is_empty());
    assert_ne!(id, UniqueId::random());
    assert_eq!(UniqueId::from_bytes(id.as_bytes()).unwrap(), id);

    assert!(UniqueId::default().check().is_err());
    assert!(UniqueId::from_bytes(&[]).is_err());
    assert!(UniqueId::from_bytes(&[0; UNIQUE_ID_BYTES]).is_err());
    assert!(UniqueId::from_bytes(&id.as_bytes()[1..]).is_err());
}
