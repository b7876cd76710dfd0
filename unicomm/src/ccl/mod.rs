//! 集合通信库抽象。

mod emulate;

pub use emulate::{
    alltoall as emulated_alltoall, gather as emulated_gather, scatter as emulated_scatter,
};

use crate::{
    bootstrap::Bootstrap, common::opaque, device::Stream, unhandled_device_error, CclError,
    DataType, DevPtr, ErrorKind, ReduceOp, Result, UniqueId,
};

/// 可选的集合通信库能力。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CclFeature {
    NativeGather,
    NativeScatter,
    NativeAlltoAll,
    /// 暂停和恢复通信域。
    Suspend,
    /// 释放之前排空通信域上的任务。
    Finalize,
}

opaque! {
    /// 集合通信库的原生通信域。
    pub struct InnerComm;
}

/// 集合通信库适配器。
///
/// 所有数据面操作只负责向任务队列提交，完成情况通过任务队列或事件同步观察。
/// 缓冲区大小总是元素数量，元素宽度由 [`DataType`] 给出。
///
/// `group_start`/`group_end` 以调用线程为单位计数嵌套，
/// 计数不为 0 期间提交的操作推迟到计数回到 0 时一起发出。
///
/// 原生实现缺少的 gather、scatter、all-to-all 由默认实现以点对点收发组合。
#[allow(clippy::too_many_arguments)]
pub trait CclAdaptor: Send + Sync {
    fn name(&self) -> &'static str;
    fn get_version(&self) -> Result<u32>;
    fn get_error_string(&self, kind: ErrorKind) -> &'static str {
        kind.as_str()
    }
    /// 通信域上最近一次错误的描述，没有错误时为空。
    fn get_last_error(&self, comm: &InnerComm) -> String {
        match self.comm_get_async_error(comm) {
            Ok(Some(e)) | Err(e) => e.to_string(),
            Ok(None) => String::new(),
        }
    }
    fn supports(&self, feature: CclFeature) -> bool;

    /// 生成新的汇合令牌，只应该由将要成为 0 号的进程调用。
    fn get_unique_id(&self) -> Result<UniqueId>;
    /// 阻塞到所有成员完成初始化。
    fn comm_init_rank(
        &self,
        nranks: usize,
        id: &UniqueId,
        rank: usize,
        bootstrap: &dyn Bootstrap,
    ) -> Result<InnerComm>;
    /// 排空已提交的任务。成功之后还要调用 [`CclAdaptor::comm_destroy`] 释放资源。
    fn comm_finalize(&self, _comm: &InnerComm) -> Result<()> {
        Err(unhandled_device_error(format!(
            "{}: comm_finalize",
            self.name()
        )))
    }
    fn comm_destroy(&self, comm: InnerComm) -> Result<()>;
    /// 不等待已提交的任务，强制释放。
    fn comm_abort(&self, comm: InnerComm) -> Result<()>;
    fn comm_suspend(&self, _comm: &InnerComm) -> Result<()> {
        Err(unhandled_device_error(format!("{}: comm_suspend", self.name())))
    }
    fn comm_resume(&self, _comm: &InnerComm) -> Result<()> {
        Err(unhandled_device_error(format!("{}: comm_resume", self.name())))
    }
    fn comm_count(&self, comm: &InnerComm) -> Result<usize>;
    fn comm_user_rank(&self, comm: &InnerComm) -> Result<usize>;
    fn comm_get_device_number(&self, comm: &InnerComm) -> Result<usize>;
    /// 通信域上的粘滞错误。
    fn comm_get_async_error(&self, comm: &InnerComm) -> Result<Option<CclError>>;

    fn reduce(
        &self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        op: ReduceOp,
        root: usize,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()>;
    /// 根进程的 `recv` 按序号依次存放每个成员的 `count` 个元素。
    fn gather(
        &self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        root: usize,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()> {
        emulate::gather(self, send, recv, count, dt, root, comm, stream)
    }
    /// 根进程 `send` 中的第 `i` 段发给 `i` 号成员。
    fn scatter(
        &self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        root: usize,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()> {
        emulate::scatter(self, send, recv, count, dt, root, comm, stream)
    }
    fn broadcast(
        &self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        root: usize,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()>;
    fn all_reduce(
        &self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        op: ReduceOp,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()>;
    /// `recv_count` 是每个成员得到的元素数。
    fn reduce_scatter(
        &self,
        send: DevPtr,
        recv: DevPtr,
        recv_count: usize,
        dt: DataType,
        op: ReduceOp,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()>;
    /// `send_count` 是每个成员贡献的元素数。
    fn all_gather(
        &self,
        send: DevPtr,
        recv: DevPtr,
        send_count: usize,
        dt: DataType,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()>;
    /// `count` 是每对成员之间交换的元素数。
    fn alltoall(
        &self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()> {
        emulate::alltoall(self, send, recv, count, dt, comm, stream)
    }
    fn send(
        &self,
        buf: DevPtr,
        count: usize,
        dt: DataType,
        peer: usize,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()>;
    fn recv(
        &self,
        buf: DevPtr,
        count: usize,
        dt: DataType,
        peer: usize,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()>;

    fn group_start(&self) -> Result<()>;
    fn group_end(&self) -> Result<()>;
}
