//! 建立通信域之前的带外握手。
//!
//! 0 号进程生成 [`UniqueId`](crate::UniqueId) 并通过 [`Store`] 分发给其他进程，
//! 所有进程用同一个标识调用初始化。初始化期间集合通信库还可以通过 [`Bootstrap`]
//! 交换额外的信息（例如设备拓扑）。

mod inproc;
mod store;

pub use inproc::InprocBootstrap;
pub use store::{exchange_unique_id, HashStore, Store, UNIQUE_ID_KEY};

use crate::Result;

/// 初始化期间可用的带外通道。
pub trait Bootstrap: Send + Sync {
    fn rank(&self) -> usize;
    fn nranks(&self) -> usize;

    /// 所有成员都到达之后才返回。
    fn barrier(&self) -> Result<()>;
    /// 发送不等待对方接收。
    fn send(&self, peer: usize, data: &[u8]) -> Result<()>;
    /// 按发送顺序接收 `peer` 的下一条消息。
    fn recv(&self, peer: usize) -> Result<Vec<u8>>;

    /// 收集所有成员的数据，结果按序号排列。
    fn all_gather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let rank = self.rank();
        let nranks = self.nranks();
        for peer in (0..nranks).filter(|&peer| peer != rank) {
            self.send(peer, data)?
        }
        (0..nranks)
            .map(|peer| {
                if peer == rank {
                    Ok(data.to_vec())
                } else {
                    self.recv(peer)
                }
            })
            .collect()
    }
}
