use crate::{ccl::CclAdaptor, system_error, Config, Result, UniqueId};
use std::{
    collections::HashMap,
    sync::{Condvar, Mutex},
    time::Duration,
};

/// 分发 [`UniqueId`] 时使用的键。
pub const UNIQUE_ID_KEY: &str = "unicomm/unique_id";

/// 键值存储，用于在初始化之前分发握手信息。
pub trait Store: Send + Sync {
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    /// 阻塞直到键存在或超时。
    fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// 进程内的键值存储。
pub struct HashStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
    cond: Condvar,
    timeout: Duration,
}

impl Default for HashStore {
    #[inline]
    fn default() -> Self {
        Self::with_timeout(Config::from_env().bootstrap_timeout)
    }
}

impl HashStore {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            map: Default::default(),
            cond: Condvar::new(),
            timeout,
        }
    }
}

impl Store for HashStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let _ = self
            .map
            .lock()
            .unwrap()
            .insert(key.into(), value.to_vec());
        self.cond.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let (map, _) = self
            .cond
            .wait_timeout_while(self.map.lock().unwrap(), self.timeout, |map| {
                !map.contains_key(key)
            })
            .unwrap();
        map.get(key)
            .cloned()
            .ok_or_else(|| system_error(format!("timed out waiting for key {key}")))
    }
}

/// 0 号进程生成并发布 [`UniqueId`]，其他进程取回并校验。
///
/// 返回之后才能调用初始化，所有进程由此看到同一个标识。
pub fn exchange_unique_id(
    store: &dyn Store,
    rank: usize,
    ccl: &dyn CclAdaptor,
) -> Result<UniqueId> {
    if rank == 0 {
        let id = ccl.get_unique_id()?;
        store.set(UNIQUE_ID_KEY, id.as_bytes())?;
        log::debug!("published {id:?}");
        Ok(id)
    } else {
        UniqueId::from_bytes(&store.get(UNIQUE_ID_KEY)?)
    }
}

#[test]
fn test_store() {
    use std::{sync::Arc, thread};

    let store = Arc::new(HashStore::with_timeout(Duration::from_secs(5)));
    let reader = {
        let store = store.clone();
        thread::spawn(move || store.get("k"))
    };
    store.set("k", b"v").unwrap();
    assert_eq!(reader.join().unwrap().unwrap(), b"v");

    let store = HashStore::with_timeout(Duration::from_millis(10));
    let e = store.get("missing").unwrap_err();
    assert_eq!(e.kind, crate::ErrorKind::SystemError);

    store.set(UNIQUE_ID_KEY, &[1, 2, 3]).unwrap();
    let e = UniqueId::from_bytes(&store.get(UNIQUE_ID_KEY).unwrap()).unwrap_err();
    assert_eq!(e.kind, crate::ErrorKind::InvalidArgument);
}
