use std::{env::var, time::Duration};

pub const ENV_ADAPTOR: &str = "UNICOMM_ADAPTOR";
pub const ENV_BOOTSTRAP_TIMEOUT: &str = "UNICOMM_BOOTSTRAP_TIMEOUT_MS";
pub const ENV_LOCAL_RANK: &str = "LOCAL_RANK";

#[derive(Clone, Debug)]
pub struct Config {
    /// 注册表中选用的适配器名字，为空时选用第一个编译进来的适配器。
    pub adaptor: Option<String>,
    /// 汇合阶段等待其他进程的最长时间。
    pub bootstrap_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adaptor: None,
            bootstrap_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut ans = Self::default();
        if let Ok(name) = var(ENV_ADAPTOR) {
            if !name.is_empty() {
                ans.adaptor = Some(name)
            }
        }
        if let Ok(ms) = var(ENV_BOOTSTRAP_TIMEOUT) {
            match ms.parse() {
                Ok(ms) => ans.bootstrap_timeout = Duration::from_millis(ms),
                Err(_) => log::warn!("ignore {ENV_BOOTSTRAP_TIMEOUT}={ms}"),
            }
        }
        ans
    }

    /// 启动器通过环境变量给出的本地序号对应的设备号。
    pub fn local_device(device_count: usize) -> Option<usize> {
        let local_rank = var(ENV_LOCAL_RANK).ok()?.parse::<usize>().ok()?;
        if device_count == 0 {
            None
        } else {
            Some(local_rank % device_count)
        }
    }
}

#[test]
fn test_default() {
    let config = Config::default();
    assert!(config.adaptor.is_none());
    assert_eq!(config.bootstrap_timeout, Duration::from_secs(60));
    assert_eq!(Config::local_device(0), None);
}
