//! 通信域的生命周期管理。

mod group;
mod work;

pub use work::Work;

use crate::{
    bootstrap::{Bootstrap, InprocBootstrap},
    ccl::{CclFeature, InnerComm},
    device::{MemKind, Stream},
    invalid_argument, invalid_usage, not_supported,
    registry::Adaptors,
    CclError, Config, DataType, DevPtr, ReduceOp, Result, UniqueId,
};
use group::{Coll, CollOp, CommandBuffer};

/// 通信域的生命周期状态。`Finalized` 和 `Aborted` 是终态。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CommState {
    Uninitialized,
    Active,
    Suspended,
    Finalized,
    Aborted,
}

/// 一个进程在一组集合通信中的身份。
///
/// 通信域独占一个原生通信域，只引用调用者提供的任务队列。
/// 所有操作都需要 `&mut self`，同一个通信域同时只能由一个线程驱动。
///
/// 后端报告的设备、系统或远端错误是粘滞的：下一次调用观察到它时通信域被强制中止，
/// 错误返回给调用者，此后所有调用都是 [`InvalidUsage`](crate::ErrorKind::InvalidUsage)。
pub struct Communicator {
    adaptors: Adaptors,
    config: Config,
    inner: Option<InnerComm>,
    state: CommState,
    rank: usize,
    nranks: usize,
    group: CommandBuffer,
    async_error: Option<CclError>,
}

impl Communicator {
    pub fn new(adaptors: Adaptors, config: Config) -> Self {
        Self {
            adaptors,
            config,
            inner: None,
            state: CommState::Uninitialized,
            rank: 0,
            nranks: 0,
            group: CommandBuffer::default(),
            async_error: None,
        }
    }

    /// 通过进程内握手加入 `id` 标识的组。
    pub fn init_rank(&mut self, nranks: usize, id: &UniqueId, rank: usize) -> Result<()> {
        self.check_uninitialized()?;
        id.check()?;
        let bootstrap = InprocBootstrap::join(id, nranks, rank, self.config.bootstrap_timeout)?;
        self.init_rank_with(nranks, id, rank, &bootstrap)
    }

    /// 使用调用者提供的握手通道初始化。
    pub fn init_rank_with(
        &mut self,
        nranks: usize,
        id: &UniqueId,
        rank: usize,
        bootstrap: &dyn Bootstrap,
    ) -> Result<()> {
        self.check_uninitialized()?;
        id.check()?;
        if rank >= nranks {
            return Err(invalid_argument(format!("rank {rank} out of {nranks}")));
        }
        let inner = self
            .adaptors
            .ccl
            .comm_init_rank(nranks, id, rank, bootstrap)?;
        self.inner = Some(inner);
        self.rank = rank;
        self.nranks = nranks;
        self.state = CommState::Active;
        log::info!(
            "communicator {rank}/{nranks} initialized with {}",
            self.adaptors.ccl.name()
        );
        Ok(())
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn nranks(&self) -> usize {
        self.nranks
    }

    #[inline]
    pub fn state(&self) -> CommState {
        self.state
    }

    #[inline]
    pub fn group_depth(&self) -> usize {
        self.group.depth
    }

    /// 最近观察到的粘滞错误。
    #[inline]
    pub fn async_error(&self) -> Option<&CclError> {
        self.async_error.as_ref()
    }

    #[inline]
    pub fn adaptors(&self) -> &Adaptors {
        &self.adaptors
    }

    pub fn device_number(&self) -> Result<usize> {
        self.adaptors
            .ccl
            .comm_get_device_number(self.inner_ref()?)
    }

    pub fn broadcast(
        &mut self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        root: usize,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(Coll::Broadcast { root }, send, recv, count, dt, stream)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn reduce(
        &mut self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        op: ReduceOp,
        root: usize,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(Coll::Reduce { op, root }, send, recv, count, dt, stream)
    }

    pub fn all_reduce(
        &mut self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        op: ReduceOp,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(Coll::AllReduce { op }, send, recv, count, dt, stream)
    }

    pub fn reduce_scatter(
        &mut self,
        send: DevPtr,
        recv: DevPtr,
        recv_count: usize,
        dt: DataType,
        op: ReduceOp,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(Coll::ReduceScatter { op }, send, recv, recv_count, dt, stream)
    }

    pub fn all_gather(
        &mut self,
        send: DevPtr,
        recv: DevPtr,
        send_count: usize,
        dt: DataType,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(Coll::AllGather, send, recv, send_count, dt, stream)
    }

    pub fn gather(
        &mut self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        root: usize,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(Coll::Gather { root }, send, recv, count, dt, stream)
    }

    pub fn scatter(
        &mut self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        root: usize,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(Coll::Scatter { root }, send, recv, count, dt, stream)
    }

    pub fn alltoall(
        &mut self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(Coll::AllToAll, send, recv, count, dt, stream)
    }

    pub fn send(
        &mut self,
        buf: DevPtr,
        count: usize,
        dt: DataType,
        peer: usize,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(Coll::Send { peer }, buf, DevPtr::null(), count, dt, stream)
    }

    pub fn recv(
        &mut self,
        buf: DevPtr,
        count: usize,
        dt: DataType,
        peer: usize,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(Coll::Recv { peer }, DevPtr::null(), buf, count, dt, stream)
    }

    pub fn group_start(&mut self) -> Result<()> {
        self.check_active()?;
        self.group.depth += 1;
        Ok(())
    }

    /// 结束一层分组。回到最外层时发出暂存的所有调用并返回完成句柄，否则返回 `None`。
    pub fn group_end(&mut self) -> Result<Option<Work>> {
        self.check_active()?;
        if self.group.depth == 0 {
            return Err(invalid_usage("group_end without group_start"));
        }
        self.group.depth -= 1;
        if self.group.depth > 0 {
            return Ok(None);
        }

        let streams = self.group.streams();
        let ops = std::mem::take(&mut self.group.ops);
        log::debug!(
            "rank {} flushes {} calls on {} streams",
            self.rank,
            ops.len(),
            streams.len()
        );
        let result = self.flush(&ops);
        self.observe(result)?;

        let device = &self.adaptors.device;
        let mut events = Vec::with_capacity(streams.len());
        for stream in &streams {
            let event = device.event_create()?;
            device.event_record(&event, stream)?;
            events.push(event)
        }
        Ok(Some(Work::new(device.clone(), events)))
    }

    /// 所有成员都到达之后才返回。
    pub fn barrier(&mut self, stream: &Stream) -> Result<()> {
        self.check_active()?;
        if self.group.depth > 0 {
            return Err(invalid_usage("barrier inside a group"));
        }
        let device = self.adaptors.device.clone();
        let dt = DataType::Float32;
        let ptr = device.device_malloc(dt.size(), MemKind::Device, None)?;
        let result = device
            .device_memset(ptr, 0, dt.size(), MemKind::Device, Some(stream))
            .and_then(|()| self.all_reduce(ptr, ptr, 1, dt, ReduceOp::Sum, stream))
            .and_then(|()| device.stream_synchronize(stream));
        let free = device.device_free(ptr, MemKind::Device, None);
        self.observe(result.and(free))
    }

    /// 排空已提交的任务后释放，只能在没有打开的分组时从 `Active` 调用。
    /// 失败时通信域保持 `Active`。
    pub fn finalize(&mut self) -> Result<()> {
        self.check_closable()?;
        let ccl = self.adaptors.ccl.clone();
        if !ccl.supports(CclFeature::Finalize) {
            return Err(not_supported(format!("{}: comm_finalize", ccl.name())));
        }
        let result = ccl.comm_finalize(self.inner_ref()?);
        self.observe(result)?;
        self.destroy()
    }

    /// 不等待已提交的任务，释放原生通信域。
    pub fn destroy(&mut self) -> Result<()> {
        self.check_closable()?;
        let Some(inner) = self.inner.take() else {
            return Err(invalid_usage("communicator has no native handle"));
        };
        self.state = CommState::Finalized;
        log::info!("communicator {}/{} destroyed", self.rank, self.nranks);
        self.adaptors.ccl.comm_destroy(inner)
    }

    /// 从任何状态强制中止。
    pub fn abort(&mut self) -> Result<()> {
        if self.state != CommState::Aborted {
            log::warn!(
                "communicator {}/{} aborted from {:?}",
                self.rank,
                self.nranks,
                self.state
            )
        }
        self.state = CommState::Aborted;
        self.group.clear();
        match self.inner.take() {
            Some(inner) => self.adaptors.ccl.comm_abort(inner),
            None => Ok(()),
        }
    }

    pub fn suspend(&mut self) -> Result<()> {
        self.check_active()?;
        if self.group.depth > 0 {
            return Err(invalid_usage("suspend inside a group"));
        }
        let ccl = self.adaptors.ccl.clone();
        if !ccl.supports(CclFeature::Suspend) {
            return Err(not_supported(format!("{}: comm_suspend", ccl.name())));
        }
        let result = ccl.comm_suspend(self.inner_ref()?);
        self.observe(result)?;
        self.state = CommState::Suspended;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state != CommState::Suspended {
            return Err(invalid_usage(format!(
                "resume a communicator in {:?} state",
                self.state
            )));
        }
        let ccl = self.adaptors.ccl.clone();
        let result = ccl.comm_resume(self.inner_ref()?);
        self.observe(result)?;
        self.state = CommState::Active;
        Ok(())
    }
}

impl Communicator {
    fn inner_ref(&self) -> Result<&InnerComm> {
        self.inner
            .as_ref()
            .ok_or_else(|| invalid_usage(format!("communicator is {:?}", self.state)))
    }

    fn check_uninitialized(&self) -> Result<()> {
        if self.state == CommState::Uninitialized {
            Ok(())
        } else {
            Err(invalid_usage(format!(
                "initialize a communicator in {:?} state",
                self.state
            )))
        }
    }

    /// 通信域必须是 `Active` 并且没有粘滞错误。
    fn check_active(&mut self) -> Result<()> {
        if self.state != CommState::Active {
            return Err(invalid_usage(format!("communicator is {:?}", self.state)));
        }
        if self.async_error.is_none() {
            let ccl = self.adaptors.ccl.clone();
            self.async_error = ccl.comm_get_async_error(self.inner_ref()?)?;
        }
        match self.async_error.clone() {
            Some(e) => {
                log::warn!("rank {} observes async error: {e}", self.rank);
                if let Err(abort) = self.abort() {
                    log::warn!("abort failed: {abort}")
                }
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn check_closable(&mut self) -> Result<()> {
        self.check_active()?;
        if self.group.depth > 0 {
            Err(invalid_usage(format!(
                "release a communicator with group depth {}",
                self.group.depth
            )))
        } else {
            Ok(())
        }
    }

    /// 把后端报告的粘滞错误记录下来。
    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.kind.is_sticky() && self.async_error.is_none() {
                self.async_error = Some(e.clone())
            }
        }
        result
    }

    fn check_rank(&self, rank: usize, role: &str) -> Result<()> {
        if rank < self.nranks {
            Ok(())
        } else {
            Err(invalid_argument(format!(
                "{role} {rank} out of {}",
                self.nranks
            )))
        }
    }

    fn submit(
        &mut self,
        coll: Coll,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        stream: &Stream,
    ) -> Result<()> {
        self.check_active()?;

        let is_root = |root| self.rank == root;
        let (need_send, need_recv) = match coll {
            Coll::Broadcast { root } | Coll::Scatter { root } => (is_root(root), true),
            Coll::Reduce { root, .. } | Coll::Gather { root } => (true, is_root(root)),
            Coll::AllReduce { .. }
            | Coll::ReduceScatter { .. }
            | Coll::AllGather
            | Coll::AllToAll => (true, true),
            Coll::Send { .. } => (true, false),
            Coll::Recv { .. } => (false, true),
        };
        match coll {
            Coll::Broadcast { root }
            | Coll::Reduce { root, .. }
            | Coll::Gather { root }
            | Coll::Scatter { root } => self.check_rank(root, "root")?,
            Coll::Send { peer } | Coll::Recv { peer } => self.check_rank(peer, "peer")?,
            _ => {}
        }
        if count > 0 {
            if need_send && send.is_null() {
                return Err(invalid_argument(format!("{coll:?} with null send buffer")));
            }
            if need_recv && recv.is_null() {
                return Err(invalid_argument(format!("{coll:?} with null recv buffer")));
            }
        }

        let op = CollOp {
            coll,
            send,
            recv,
            count,
            dt,
            stream: stream.clone(),
        };
        if self.group.depth > 0 {
            self.group.ops.push(op);
            Ok(())
        } else {
            let result = op.issue(&*self.adaptors.ccl, self.inner_ref()?);
            self.observe(result)
        }
    }

    /// 在一个后端分组之内发出所有调用，出错时也结束后端分组。
    fn flush(&self, ops: &[CollOp]) -> Result<()> {
        let ccl = &*self.adaptors.ccl;
        let inner = self.inner_ref()?;
        ccl.group_start()?;
        let result = ops.iter().try_for_each(|op| op.issue(ccl, inner));
        let end = ccl.group_end();
        result.and(end)
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if !matches!(self.state, CommState::Active | CommState::Suspended) {
            return;
        }
        if let Some(inner) = self.inner.take() {
            self.state = CommState::Finalized;
            if let Err(e) = self.adaptors.ccl.comm_destroy(inner) {
                log::warn!("failed to destroy communicator on drop: {e}")
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{CommState, Communicator};
    use crate::{
        bootstrap::{exchange_unique_id, HashStore},
        common_cpu::Cpu,
        device::Stream,
        inproc::Inproc,
        registry::Adaptors,
        CclAdaptor, Config, DataType, DevPtr, ErrorKind, ReduceOp, UniqueId,
    };
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    fn adaptors(ccl: Inproc) -> Adaptors {
        Adaptors::new(Arc::new(Cpu::default()), Arc::new(ccl))
    }

    /// 每个成员一个线程，初始化之后在自己的任务队列上执行 `f`。
    fn run<T, F>(adaptors: Adaptors, n: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(&mut Communicator, &Stream) -> T + Send + Sync + 'static,
    {
        let id = UniqueId::random();
        let f = Arc::new(f);
        (0..n)
            .map(|rank| {
                let adaptors = adaptors.clone();
                let f = f.clone();
                thread::spawn(move || {
                    let device = adaptors.device.clone();
                    let mut comm = Communicator::new(adaptors, Config::default());
                    comm.init_rank(n, &id, rank).unwrap();
                    assert_eq!(comm.state(), CommState::Active);
                    let stream = device.stream_create().unwrap();
                    let ans = f(&mut comm, &stream);
                    let _ = device.stream_synchronize(&stream);
                    device.stream_destroy(stream).ok();
                    ans
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    }

    fn ptr<T>(buf: &mut [T]) -> DevPtr {
        DevPtr::from_host(buf)
    }

    #[test]
    fn test_all_gather() {
        let store = Arc::new(HashStore::with_timeout(Duration::from_secs(10)));
        let adaptors = adaptors(Inproc::new());
        let results = (0..4)
            .map(|rank| {
                let store = store.clone();
                let adaptors = adaptors.clone();
                thread::spawn(move || {
                    let id = exchange_unique_id(&*store, rank, &*adaptors.ccl).unwrap();
                    let device = adaptors.device.clone();
                    let mut comm = Communicator::new(adaptors, Config::default());
                    comm.init_rank(4, &id, rank).unwrap();
                    assert_eq!((comm.rank(), comm.nranks()), (rank, 4));
                    assert_eq!(comm.device_number().unwrap(), 0);

                    let stream = device.stream_create().unwrap();
                    let mut send = [rank as f32];
                    let mut recv = [0.0f32; 4];
                    comm.all_gather(
                        ptr(&mut send),
                        ptr(&mut recv),
                        1,
                        DataType::Float32,
                        &stream,
                    )
                    .unwrap();
                    device.stream_synchronize(&stream).unwrap();
                    comm.finalize().unwrap();
                    assert_eq!(comm.state(), CommState::Finalized);
                    recv
                })
            })
            .collect::<Vec<_>>();
        for h in results {
            assert_eq!(h.join().unwrap(), [0., 1., 2., 3.])
        }
    }

    #[test]
    fn test_emulated_gather() {
        let results = run(adaptors(Inproc::p2p_only()), 3, |comm, stream| {
            let mut send = [comm.rank() as f32 * 10.];
            let mut recv = [-1.0f32; 3];
            comm.gather(
                ptr(&mut send),
                ptr(&mut recv),
                1,
                DataType::Float32,
                1,
                stream,
            )
            .unwrap();
            comm.barrier(stream).unwrap();
            recv
        });
        assert_eq!(results[0], [-1.; 3]);
        assert_eq!(results[1], [0., 10., 20.]);
        assert_eq!(results[2], [-1.; 3]);
    }

    #[test]
    fn test_group() {
        let n = 3;
        let results = run(adaptors(Inproc::p2p_only()), n, move |comm, stream| {
            let rank = comm.rank();
            let mut sum = [rank as i32 + 1];
            let mut token = [rank as u32 * 100];
            let mut from_left = [0u32];
            let mut swapped = vec![0u32; n];
            let mut mine = (0..n).map(|peer| (rank * 10 + peer) as u32).collect::<Vec<_>>();

            assert_eq!(comm.group_end().unwrap_err().kind, ErrorKind::InvalidUsage);
            comm.group_start().unwrap();
            comm.group_start().unwrap();
            let p = ptr(&mut sum);
            comm.all_reduce(p, p, 1, DataType::Int32, ReduceOp::Sum, stream)
                .unwrap();
            comm.recv(
                ptr(&mut from_left),
                1,
                DataType::Uint32,
                (rank + n - 1) % n,
                stream,
            )
            .unwrap();
            comm.send(ptr(&mut token), 1, DataType::Uint32, (rank + 1) % n, stream)
                .unwrap();
            assert!(comm.group_end().unwrap().is_none());
            comm.alltoall(
                ptr(&mut mine),
                ptr(&mut swapped),
                1,
                DataType::Uint32,
                stream,
            )
            .unwrap();

            assert_eq!(comm.finalize().unwrap_err().kind, ErrorKind::InvalidUsage);
            assert_eq!(comm.destroy().unwrap_err().kind, ErrorKind::InvalidUsage);
            assert_eq!(comm.state(), CommState::Active);

            let work = comm.group_end().unwrap().unwrap();
            assert!(!work.is_empty());
            work.wait().unwrap();
            assert_eq!(comm.group_depth(), 0);
            comm.destroy().unwrap();
            (sum, from_left, swapped)
        });
        for (rank, (sum, from_left, swapped)) in results.into_iter().enumerate() {
            assert_eq!(sum, [6]);
            assert_eq!(from_left, [((rank + n - 1) % n) as u32 * 100]);
            let expect = (0..n).map(|peer| (peer * 10 + rank) as u32).collect::<Vec<_>>();
            assert_eq!(swapped, expect);
        }
    }

    #[test]
    fn test_suspend() {
        let results = run(adaptors(Inproc::new()), 2, |comm, stream| {
            let mut buf = [1u8];
            let p = ptr(&mut buf);
            comm.suspend().unwrap();
            assert_eq!(comm.state(), CommState::Suspended);
            let e = comm
                .all_reduce(p, p, 1, DataType::Uint8, ReduceOp::Sum, stream)
                .unwrap_err();
            assert_eq!(e.kind, ErrorKind::InvalidUsage);
            comm.resume().unwrap();
            assert_eq!(comm.state(), CommState::Active);
            comm.all_reduce(p, p, 1, DataType::Uint8, ReduceOp::Sum, stream)
                .unwrap();
            comm.barrier(stream).unwrap();
            buf
        });
        assert!(results.iter().all(|buf| *buf == [2]));

        run(adaptors(Inproc::p2p_only()), 1, |comm, _| {
            assert_eq!(comm.suspend().unwrap_err().kind, ErrorKind::NotSupported);
            assert_eq!(comm.resume().unwrap_err().kind, ErrorKind::InvalidUsage);
            assert_eq!(comm.state(), CommState::Active);
        });
    }

    #[test]
    fn test_abort() {
        run(adaptors(Inproc::new()), 1, |comm, stream| {
            let mut buf = [0u8];
            let p = ptr(&mut buf);
            comm.group_start().unwrap();
            comm.abort().unwrap();
            assert_eq!(comm.state(), CommState::Aborted);
            assert_eq!(comm.group_depth(), 0);
            let e = comm
                .all_reduce(p, p, 1, DataType::Uint8, ReduceOp::Sum, stream)
                .unwrap_err();
            assert_eq!(e.kind, ErrorKind::InvalidUsage);
            assert_eq!(comm.finalize().unwrap_err().kind, ErrorKind::InvalidUsage);
            assert_eq!(comm.group_start().unwrap_err().kind, ErrorKind::InvalidUsage);
            comm.abort().unwrap();
            assert_eq!(comm.state(), CommState::Aborted);
        });

        let mut comm = Communicator::new(adaptors(Inproc::new()), Config::default());
        comm.abort().unwrap();
        assert_eq!(comm.state(), CommState::Aborted);
        let e = comm.init_rank(1, &UniqueId::random(), 0).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidUsage);
    }

    #[test]
    fn test_peer_abort() {
        let aborted = Arc::new(Barrier::new(2));
        let results = run(adaptors(Inproc::new()), 2, move |comm, stream| {
            comm.barrier(stream).unwrap();
            if comm.rank() == 0 {
                comm.abort().unwrap();
                aborted.wait();
                return None;
            }
            aborted.wait();
            let mut buf = [0u8];
            let p = ptr(&mut buf);
            let e = comm
                .all_reduce(p, p, 1, DataType::Uint8, ReduceOp::Sum, stream)
                .unwrap_err();
            assert_eq!(comm.state(), CommState::Aborted);
            assert_eq!(comm.async_error().map(|e| e.kind), Some(ErrorKind::RemoteError));
            let again = comm
                .all_reduce(p, p, 1, DataType::Uint8, ReduceOp::Sum, stream)
                .unwrap_err();
            assert_eq!(again.kind, ErrorKind::InvalidUsage);
            Some(e.kind)
        });
        assert_eq!(results, [None, Some(ErrorKind::RemoteError)]);
    }

    #[test]
    fn test_work_after_peer_abort() {
        let issued = Arc::new(Barrier::new(2));
        let aborted = Arc::new(Barrier::new(2));
        let results = run(adaptors(Inproc::new()), 2, move |comm, stream| {
            if comm.rank() == 0 {
                issued.wait();
                comm.abort().unwrap();
                aborted.wait();
                return None;
            }
            let mut buf = [7u8; 4];
            comm.group_start().unwrap();
            comm.recv(ptr(&mut buf), 4, DataType::Uint8, 0, stream)
                .unwrap();
            let work = comm.group_end().unwrap().unwrap();
            issued.wait();
            aborted.wait();

            let e = work.wait().unwrap_err();
            assert_eq!(work.query().unwrap_err().kind, e.kind);
            assert_eq!(buf, [7; 4]);
            Some(e.kind)
        });
        assert_eq!(results, [None, Some(ErrorKind::RemoteError)]);
    }

    #[test]
    fn test_init() {
        let mut comm = Communicator::new(adaptors(Inproc::new()), Config::default());
        let e = comm.init_rank(1, &UniqueId::default(), 0).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidArgument);
        assert_eq!(comm.state(), CommState::Uninitialized);

        comm.init_rank(1, &UniqueId::random(), 0).unwrap();
        let e = comm.init_rank(1, &UniqueId::random(), 0).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidUsage);
    }

    #[test]
    fn test_mismatched_id() {
        let config = Config {
            bootstrap_timeout: Duration::from_millis(100),
            ..Config::default()
        };
        let adaptors = adaptors(Inproc::new());
        let handles = [UniqueId::random(), UniqueId::random()]
            .into_iter()
            .enumerate()
            .map(|(rank, id)| {
                let adaptors = adaptors.clone();
                let config = config.clone();
                thread::spawn(move || {
                    let mut comm = Communicator::new(adaptors, config);
                    let e = comm.init_rank(2, &id, rank).unwrap_err();
                    (e.kind, comm.state())
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            assert_eq!(
                h.join().unwrap(),
                (ErrorKind::SystemError, CommState::Uninitialized)
            )
        }
    }

    #[test]
    fn test_drop() {
        let ccl = Arc::new(Inproc::new());
        let adaptors = Adaptors::new(Arc::new(Cpu::default()), ccl.clone());
        let mut comm = Communicator::new(adaptors, Config::default());
        comm.init_rank(1, &UniqueId::random(), 0).unwrap();
        assert!(ccl.get_version().unwrap() < 1_000_000);
        drop(comm);
    }
}
