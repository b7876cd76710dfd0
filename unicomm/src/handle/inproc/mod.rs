//! 以同一进程内的线程为成员的集合通信库。
//!
//! 数据面操作在 [`common_cpu`](crate::common_cpu) 的任务队列上执行，成员之间通过信箱交换数据。
//! 归约按序号顺序进行，所有成员得到逐位相同的结果。

mod collective;
mod group;
mod reduce;

use crate::{
    bootstrap::Bootstrap,
    ccl::{emulated_alltoall, emulated_gather, emulated_scatter, CclAdaptor, CclFeature, InnerComm},
    common_cpu::current_device,
    device::Stream,
    inproc_node::{InprocNode, Mesh},
    internal_error, invalid_argument, invalid_usage, remote_error, unhandled_device_error,
    CclError, DataType, DevPtr, ReduceOp, Result, UniqueId,
};
use group::{Post, Task};
use std::{
    collections::HashMap,
    mem::size_of,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc, Condvar, Mutex, OnceLock,
    },
};

pub struct Inproc {
    native: bool,
}

impl Default for Inproc {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Inproc {
    /// 带有原生 gather、scatter、all-to-all 的实现。
    #[inline]
    pub const fn new() -> Self {
        Self { native: true }
    }

    /// 只有点对点收发的实现，gather、scatter、all-to-all 走模拟路径，也不支持暂停。
    #[inline]
    pub const fn p2p_only() -> Self {
        Self { native: false }
    }
}

/// 一个成员在通信域中的状态，提交出去的任务也持有它。
pub(super) struct Shared {
    node: InprocNode,
    devices: Vec<usize>,
    error: Mutex<Option<CclError>>,
    suspended: AtomicBool,
    closed: AtomicBool,
    pending: Mutex<usize>,
    drained: Condvar,
}

impl Shared {
    fn begin(&self) {
        *self.pending.lock().unwrap() += 1
    }

    fn end(&self) {
        *self.pending.lock().unwrap() -= 1;
        self.drained.notify_all()
    }

    fn fail(&self, e: CclError) {
        log::debug!("rank {} failed: {e}", self.node.rank());
        self.error.lock().unwrap().get_or_insert(e);
    }

    fn drain(&self) {
        let _guard = self
            .drained
            .wait_while(self.pending.lock().unwrap(), |n| *n > 0)
            .unwrap();
    }

    fn check_submit(&self) -> Result<()> {
        if self.closed.load(SeqCst) {
            Err(invalid_usage("communicator is released"))
        } else if self.suspended.load(SeqCst) {
            Err(invalid_usage("communicator is suspended"))
        } else {
            Ok(())
        }
    }

    fn check_rank(&self, rank: usize, role: &str) -> Result<()> {
        let n = self.node.group_size();
        if rank < n {
            Ok(())
        } else {
            Err(invalid_argument(format!("{role} {rank} out of {n}")))
        }
    }
}

struct InprocComm(Arc<Shared>);

fn meshes() -> &'static Mutex<HashMap<UniqueId, Arc<Mesh>>> {
    static MESHES: OnceLock<Mutex<HashMap<UniqueId, Arc<Mesh>>>> = OnceLock::new();
    MESHES.get_or_init(Default::default)
}

fn forget(id: &UniqueId, mesh: &Arc<Mesh>) {
    let mut meshes = meshes().lock().unwrap();
    if meshes.get(id).is_some_and(|m| Arc::ptr_eq(m, mesh)) {
        meshes.remove(id);
    }
}

fn check_ptr(ptr: DevPtr, count: usize, name: &str) -> Result<()> {
    if ptr.is_null() && count > 0 {
        Err(invalid_argument(format!("{name} buffer is null")))
    } else {
        Ok(())
    }
}

impl Inproc {
    #[inline]
    fn shared<'a>(&self, comm: &'a InnerComm) -> Result<&'a Arc<Shared>> {
        Ok(&comm.native::<InprocComm>()?.0)
    }

    fn submit(
        &self,
        comm: &InnerComm,
        stream: &Stream,
        check: impl FnOnce(&Shared) -> Result<()>,
        post: impl FnOnce(InprocNode) -> Post,
    ) -> Result<()> {
        let shared = self.shared(comm)?;
        shared.check_submit()?;
        check(shared)?;
        log::trace!("rank {} submits on {stream:?}", shared.node.rank());
        group::submit(stream, Task::new(shared, post(shared.node.clone())))
    }
}

impl CclAdaptor for Inproc {
    #[inline]
    fn name(&self) -> &'static str {
        if self.native {
            "inproc"
        } else {
            "inproc-p2p"
        }
    }

    fn get_version(&self) -> Result<u32> {
        let [major, minor, patch] = [
            env!("CARGO_PKG_VERSION_MAJOR"),
            env!("CARGO_PKG_VERSION_MINOR"),
            env!("CARGO_PKG_VERSION_PATCH"),
        ]
        .map(|s| s.parse::<u32>().unwrap_or(0));
        Ok(major * 10000 + minor * 100 + patch)
    }

    fn supports(&self, feature: CclFeature) -> bool {
        match feature {
            CclFeature::NativeGather
            | CclFeature::NativeScatter
            | CclFeature::NativeAlltoAll
            | CclFeature::Suspend => self.native,
            CclFeature::Finalize => true,
        }
    }

    #[inline]
    fn get_unique_id(&self) -> Result<UniqueId> {
        Ok(UniqueId::random())
    }

    fn comm_init_rank(
        &self,
        nranks: usize,
        id: &UniqueId,
        rank: usize,
        bootstrap: &dyn Bootstrap,
    ) -> Result<InnerComm> {
        id.check()?;
        if rank >= nranks {
            return Err(invalid_argument(format!("rank {rank} out of {nranks}")));
        }
        if bootstrap.rank() != rank || bootstrap.nranks() != nranks {
            return Err(invalid_argument(format!(
                "bootstrap is rank {}/{}, initializing rank {rank}/{nranks}",
                bootstrap.rank(),
                bootstrap.nranks()
            )));
        }

        let mesh = {
            let mut meshes = meshes().lock().unwrap();
            let mesh = meshes
                .entry(*id)
                .or_insert_with(|| Mesh::new(nranks))
                .clone();
            if mesh.group_size() != nranks {
                return Err(invalid_argument(format!(
                    "{id:?} has {} ranks, initialized with {nranks}",
                    mesh.group_size()
                )));
            }
            mesh
        };

        let device = current_device();
        let devices = match bootstrap.all_gather(&device.to_le_bytes()) {
            Ok(devices) => devices,
            Err(e) => {
                forget(id, &mesh);
                return Err(e);
            }
        };
        // 0 号收到所有成员的消息时所有成员都已取得消息网
        if rank == 0 {
            forget(id, &mesh)
        }
        let devices = devices
            .into_iter()
            .map(|bytes| {
                <[u8; size_of::<usize>()]>::try_from(&*bytes)
                    .map(usize::from_le_bytes)
                    .map_err(|_| internal_error("malformed device number from bootstrap"))
            })
            .collect::<Result<Vec<_>>>()?;
        if devices.len() != nranks {
            return Err(internal_error(format!(
                "bootstrap gathered {} device numbers for {nranks} ranks",
                devices.len()
            )));
        }

        log::info!("{}: rank {rank}/{nranks} on device {device}", self.name());
        Ok(InnerComm::new(InprocComm(Arc::new(Shared {
            node: InprocNode::new(rank, mesh),
            devices,
            error: Mutex::new(None),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pending: Mutex::new(0),
            drained: Condvar::new(),
        }))))
    }

    fn comm_finalize(&self, comm: &InnerComm) -> Result<()> {
        let shared = self.shared(comm)?;
        shared.drain();
        shared.closed.store(true, SeqCst);
        Ok(())
    }

    fn comm_destroy(&self, comm: InnerComm) -> Result<()> {
        let shared = self.shared(&comm)?;
        shared.closed.store(true, SeqCst);
        log::debug!("rank {} destroyed", shared.node.rank());
        Ok(())
    }

    fn comm_abort(&self, comm: InnerComm) -> Result<()> {
        let shared = self.shared(&comm)?;
        shared.closed.store(true, SeqCst);
        shared.node.mesh().abort();
        Ok(())
    }

    fn comm_suspend(&self, comm: &InnerComm) -> Result<()> {
        if !self.supports(CclFeature::Suspend) {
            return Err(unhandled_device_error(format!("{}: comm_suspend", self.name())));
        }
        let shared = self.shared(comm)?;
        shared.check_submit()?;
        shared.suspended.store(true, SeqCst);
        Ok(())
    }

    fn comm_resume(&self, comm: &InnerComm) -> Result<()> {
        if !self.supports(CclFeature::Suspend) {
            return Err(unhandled_device_error(format!("{}: comm_resume", self.name())));
        }
        self.shared(comm)?.suspended.store(false, SeqCst);
        Ok(())
    }

    #[inline]
    fn comm_count(&self, comm: &InnerComm) -> Result<usize> {
        Ok(self.shared(comm)?.node.group_size())
    }

    #[inline]
    fn comm_user_rank(&self, comm: &InnerComm) -> Result<usize> {
        Ok(self.shared(comm)?.node.rank())
    }

    #[inline]
    fn comm_get_device_number(&self, comm: &InnerComm) -> Result<usize> {
        let shared = self.shared(comm)?;
        Ok(shared.devices[shared.node.rank()])
    }

    fn comm_get_async_error(&self, comm: &InnerComm) -> Result<Option<CclError>> {
        let shared = self.shared(comm)?;
        if let Some(e) = &*shared.error.lock().unwrap() {
            return Ok(Some(e.clone()));
        }
        if shared.node.mesh().is_aborted() && !shared.closed.load(SeqCst) {
            return Ok(Some(remote_error("a peer aborted the communicator")));
        }
        Ok(None)
    }

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
    ) -> Result<()> {
        self.submit(
            comm,
            stream,
            |s| {
                s.check_rank(root, "root")?;
                check_ptr(send, count, "send")?;
                if s.node.rank() == root {
                    check_ptr(recv, count, "recv")?
                }
                Ok(())
            },
            |node| collective::reduce(node, send, recv, dt.nbytes(count), dt, op, root),
        )
    }

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
        if !self.native {
            return emulated_gather(self, send, recv, count, dt, root, comm, stream);
        }
        self.submit(
            comm,
            stream,
            |s| {
                s.check_rank(root, "root")?;
                check_ptr(send, count, "send")?;
                if s.node.rank() == root {
                    check_ptr(recv, count, "recv")?
                }
                Ok(())
            },
            |node| collective::gather(node, send, recv, dt.nbytes(count), root),
        )
    }

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
        if !self.native {
            return emulated_scatter(self, send, recv, count, dt, root, comm, stream);
        }
        self.submit(
            comm,
            stream,
            |s| {
                s.check_rank(root, "root")?;
                check_ptr(recv, count, "recv")?;
                if s.node.rank() == root {
                    check_ptr(send, count, "send")?
                }
                Ok(())
            },
            |node| collective::scatter(node, send, recv, dt.nbytes(count), root),
        )
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
    ) -> Result<()> {
        self.submit(
            comm,
            stream,
            |s| {
                s.check_rank(root, "root")?;
                check_ptr(recv, count, "recv")?;
                if s.node.rank() == root {
                    check_ptr(send, count, "send")?
                }
                Ok(())
            },
            |node| collective::broadcast(node, send, recv, dt.nbytes(count), root),
        )
    }

    fn all_reduce(
        &self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        op: ReduceOp,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(
            comm,
            stream,
            |_| {
                check_ptr(send, count, "send")?;
                check_ptr(recv, count, "recv")
            },
            |node| collective::all_reduce(node, send, recv, dt.nbytes(count), dt, op),
        )
    }

    fn reduce_scatter(
        &self,
        send: DevPtr,
        recv: DevPtr,
        recv_count: usize,
        dt: DataType,
        op: ReduceOp,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(
            comm,
            stream,
            |_| {
                check_ptr(send, recv_count, "send")?;
                check_ptr(recv, recv_count, "recv")
            },
            |node| collective::reduce_scatter(node, send, recv, dt.nbytes(recv_count), dt, op),
        )
    }

    fn all_gather(
        &self,
        send: DevPtr,
        recv: DevPtr,
        send_count: usize,
        dt: DataType,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(
            comm,
            stream,
            |_| {
                check_ptr(send, send_count, "send")?;
                check_ptr(recv, send_count, "recv")
            },
            |node| collective::all_gather(node, send, recv, dt.nbytes(send_count)),
        )
    }

    fn alltoall(
        &self,
        send: DevPtr,
        recv: DevPtr,
        count: usize,
        dt: DataType,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()> {
        if !self.native {
            return emulated_alltoall(self, send, recv, count, dt, comm, stream);
        }
        self.submit(
            comm,
            stream,
            |_| {
                check_ptr(send, count, "send")?;
                check_ptr(recv, count, "recv")
            },
            |node| collective::alltoall(node, send, recv, dt.nbytes(count)),
        )
    }

    fn send(
        &self,
        buf: DevPtr,
        count: usize,
        dt: DataType,
        peer: usize,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(
            comm,
            stream,
            |s| {
                s.check_rank(peer, "peer")?;
                check_ptr(buf, count, "send")
            },
            |node| collective::send(node, buf, dt.nbytes(count), peer),
        )
    }

    fn recv(
        &self,
        buf: DevPtr,
        count: usize,
        dt: DataType,
        peer: usize,
        comm: &InnerComm,
        stream: &Stream,
    ) -> Result<()> {
        self.submit(
            comm,
            stream,
            |s| {
                s.check_rank(peer, "peer")?;
                check_ptr(buf, count, "recv")
            },
            |node| collective::recv(node, buf, dt.nbytes(count), peer),
        )
    }

    #[inline]
    fn group_start(&self) -> Result<()> {
        group::start();
        Ok(())
    }

    #[inline]
    fn group_end(&self) -> Result<()> {
        group::end()
    }
}

#[cfg(test)]
mod test {
    use super::Inproc;
    use crate::{
        bootstrap::{Bootstrap, InprocBootstrap},
        ccl::{CclAdaptor, InnerComm},
        common_cpu::{Cpu, CpuStream},
        device::{DeviceRuntime, Stream},
        DataType, DevPtr, ErrorKind, ReduceOp, UniqueId,
    };
    use std::{sync::Arc, thread, time::Duration};

    fn run<T, F>(ccl: Inproc, n: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(usize, &Inproc, &InnerComm, &Stream) -> T + Send + Sync + 'static,
    {
        let id = UniqueId::random();
        let ccl = Arc::new(ccl);
        let cpu = Arc::new(Cpu::default());
        let f = Arc::new(f);
        (0..n)
            .map(|rank| {
                let ccl = ccl.clone();
                let cpu = cpu.clone();
                let f = f.clone();
                thread::spawn(move || {
                    let boot =
                        InprocBootstrap::join(&id, n, rank, Duration::from_secs(10)).unwrap();
                    let comm = ccl.comm_init_rank(n, &id, rank, &boot).unwrap();
                    let stream = cpu.stream_create().unwrap();
                    let ans = f(rank, &ccl, &comm, &stream);
                    cpu.stream_synchronize(&stream).unwrap();
                    assert!(ccl.comm_get_async_error(&comm).unwrap().is_none());
                    ccl.comm_finalize(&comm).unwrap();
                    ccl.comm_destroy(comm).unwrap();
                    cpu.stream_destroy(stream).unwrap();
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

    /// 缓冲区在栈上，返回之前必须等任务队列清空。
    fn sync(stream: &Stream) {
        stream
            .native::<CpuStream>()
            .unwrap()
            .state()
            .synchronize()
            .unwrap()
    }

    #[test]
    fn test_all_gather() {
        let results = run(Inproc::new(), 4, |rank, ccl, comm, stream| {
            let mut send = [rank as f32];
            let mut recv = vec![-1.0f32; 4];
            ccl.all_gather(
                ptr(&mut send),
                ptr(&mut recv),
                1,
                DataType::Float32,
                comm,
                stream,
            )
            .unwrap();
            sync(stream);
            recv
        });
        for recv in results {
            assert_eq!(recv, [0., 1., 2., 3.])
        }
    }

    #[test]
    fn test_all_reduce() {
        let results = run(Inproc::new(), 3, |rank, ccl, comm, stream| {
            let mut ints = vec![rank as i32 + 1, -(rank as i32)];
            let p = ptr(&mut ints);
            ccl.all_reduce(p, p, 2, DataType::Int32, ReduceOp::Prod, comm, stream)
                .unwrap();

            let mut send = [rank as f32 * 3.];
            let mut avg = [0.0f32];
            ccl.all_reduce(
                ptr(&mut send),
                ptr(&mut avg),
                1,
                DataType::Float32,
                ReduceOp::Avg,
                comm,
                stream,
            )
            .unwrap();
            sync(stream);
            (ints, avg)
        });
        for (ints, avg) in results {
            assert_eq!(ints, [6, 0]);
            assert_eq!(avg, [3.]);
        }
    }

    #[test]
    fn test_rooted() {
        let results = run(Inproc::new(), 3, |rank, ccl, comm, stream| {
            let mut value = [rank as u64 * 7 + 1];
            let mut bcast = [0u64];
            ccl.broadcast(
                ptr(&mut value),
                ptr(&mut bcast),
                1,
                DataType::Uint64,
                2,
                comm,
                stream,
            )
            .unwrap();

            let mut max = [0u64];
            ccl.reduce(
                ptr(&mut value),
                ptr(&mut max),
                1,
                DataType::Uint64,
                ReduceOp::Max,
                0,
                comm,
                stream,
            )
            .unwrap();
            sync(stream);
            (bcast, max)
        });
        for (rank, (bcast, max)) in results.into_iter().enumerate() {
            assert_eq!(bcast, [15]);
            assert_eq!(max, [if rank == 0 { 15 } else { 0 }]);
        }
    }

    #[test]
    fn test_reduce_scatter() {
        let results = run(Inproc::new(), 3, |rank, ccl, comm, stream| {
            let mut send = (0..6).map(|i| (rank * 10 + i) as i64).collect::<Vec<_>>();
            let mut recv = [0i64; 2];
            ccl.reduce_scatter(
                ptr(&mut send),
                ptr(&mut recv),
                2,
                DataType::Int64,
                ReduceOp::Sum,
                comm,
                stream,
            )
            .unwrap();
            sync(stream);
            recv
        });
        for (rank, recv) in results.into_iter().enumerate() {
            let i = rank as i64 * 2;
            assert_eq!(recv, [30 + 3 * i, 33 + 3 * i]);
        }
    }

    fn gather_scenario(ccl: Inproc) {
        let results = run(ccl, 3, |rank, ccl, comm, stream| {
            let mut send = [rank as f32 * 10.];
            let mut recv = [-1.0f32; 3];
            ccl.gather(
                ptr(&mut send),
                ptr(&mut recv),
                1,
                DataType::Float32,
                1,
                comm,
                stream,
            )
            .unwrap();
            sync(stream);
            recv
        });
        for (rank, recv) in results.into_iter().enumerate() {
            if rank == 1 {
                assert_eq!(recv, [0., 10., 20.])
            } else {
                assert_eq!(recv, [-1.; 3])
            }
        }
    }

    #[test]
    fn test_gather() {
        gather_scenario(Inproc::new());
        gather_scenario(Inproc::p2p_only());
    }

    fn scatter_scenario(ccl: Inproc) {
        let results = run(ccl, 4, |rank, ccl, comm, stream| {
            let mut send = if rank == 3 {
                vec![1u8, 2, 3, 4, 5, 6, 7, 8]
            } else {
                vec![]
            };
            let mut recv = [0u8; 2];
            ccl.scatter(
                ptr(&mut send),
                ptr(&mut recv),
                2,
                DataType::Uint8,
                3,
                comm,
                stream,
            )
            .unwrap();
            sync(stream);
            (send, recv)
        });
        for (rank, (_, recv)) in results.into_iter().enumerate() {
            assert_eq!(recv, [rank as u8 * 2 + 1, rank as u8 * 2 + 2]);
        }
    }

    #[test]
    fn test_scatter() {
        scatter_scenario(Inproc::new());
        scatter_scenario(Inproc::p2p_only());
    }

    fn alltoall_expect(rank: usize, n: usize) -> Vec<u32> {
        (0..n).map(|peer| (peer * 100 + rank) as u32).collect()
    }

    fn alltoall_scenario(ccl: Inproc, n: usize) {
        let results = run(ccl, n, move |rank, ccl, comm, stream| {
            let mut send = (0..n).map(|peer| (rank * 100 + peer) as u32).collect::<Vec<_>>();
            let mut recv = vec![0u32; n];
            ccl.alltoall(
                ptr(&mut send),
                ptr(&mut recv),
                1,
                DataType::Uint32,
                comm,
                stream,
            )
            .unwrap();
            sync(stream);
            (send, recv)
        });
        for (rank, (_, recv)) in results.into_iter().enumerate() {
            assert_eq!(recv, alltoall_expect(rank, n));
        }
    }

    #[test]
    fn test_alltoall() {
        for n in 1..=4 {
            alltoall_scenario(Inproc::new(), n);
            alltoall_scenario(Inproc::p2p_only(), n);
        }
    }

    #[test]
    fn test_alltoall_any_order() {
        use rand::seq::SliceRandom;

        let n = 5;
        let results = run(Inproc::new(), n, move |rank, ccl, comm, stream| {
            let mut send = (0..n).map(|peer| (rank * 100 + peer) as u32).collect::<Vec<_>>();
            let mut recv = vec![0u32; n];
            let (s, r) = (ptr(&mut send), ptr(&mut recv));

            let mut calls = (0..n)
                .flat_map(|peer| [(peer, true), (peer, false)])
                .collect::<Vec<_>>();
            calls.shuffle(&mut rand::thread_rng());
            ccl.group_start().unwrap();
            for (peer, is_send) in calls {
                let result = if is_send {
                    ccl.send(s.byte_add(peer * 4), 1, DataType::Uint32, peer, comm, stream)
                } else {
                    ccl.recv(r.byte_add(peer * 4), 1, DataType::Uint32, peer, comm, stream)
                };
                result.unwrap()
            }
            ccl.group_end().unwrap();
            sync(stream);
            (send, recv)
        });
        for (rank, (_, recv)) in results.into_iter().enumerate() {
            assert_eq!(recv, alltoall_expect(rank, n));
        }
    }

    #[test]
    fn test_group_balance() {
        let ccl = Inproc::new();
        assert_eq!(ccl.group_end().unwrap_err().kind, ErrorKind::InvalidUsage);
        ccl.group_start().unwrap();
        ccl.group_start().unwrap();
        ccl.group_end().unwrap();
        ccl.group_end().unwrap();
        assert_eq!(ccl.group_end().unwrap_err().kind, ErrorKind::InvalidUsage);
    }

    #[test]
    fn test_suspend() {
        run(Inproc::p2p_only(), 1, |_, ccl, comm, _| {
            let e = ccl.comm_suspend(comm).unwrap_err();
            assert_eq!(e.kind, ErrorKind::UnhandledDeviceError);
        });
        run(Inproc::new(), 2, |_, ccl, comm, stream| {
            let mut buf = [1u8];
            ccl.comm_suspend(comm).unwrap();
            let e = ccl
                .all_reduce(
                    ptr(&mut buf),
                    ptr(&mut buf),
                    1,
                    DataType::Uint8,
                    ReduceOp::Sum,
                    comm,
                    stream,
                )
                .unwrap_err();
            assert_eq!(e.kind, ErrorKind::InvalidUsage);
            ccl.comm_resume(comm).unwrap();
            ccl.all_reduce(
                ptr(&mut buf),
                ptr(&mut buf),
                1,
                DataType::Uint8,
                ReduceOp::Sum,
                comm,
                stream,
            )
            .unwrap();
            sync(stream);
            buf
        });
    }

    #[test]
    fn test_abort() {
        let id = UniqueId::random();
        let cpu = Arc::new(Cpu::default());
        let handles = (0..2)
            .map(|rank| {
                let cpu = cpu.clone();
                thread::spawn(move || {
                    let ccl = Inproc::new();
                    let boot =
                        InprocBootstrap::join(&id, 2, rank, Duration::from_secs(10)).unwrap();
                    let comm = ccl.comm_init_rank(2, &id, rank, &boot).unwrap();
                    assert_eq!(ccl.comm_count(&comm).unwrap(), 2);
                    assert_eq!(ccl.comm_user_rank(&comm).unwrap(), rank);
                    assert_eq!(ccl.comm_get_device_number(&comm).unwrap(), 0);
                    if rank == 0 {
                        boot.barrier().unwrap();
                        ccl.comm_abort(comm).unwrap();
                        return None;
                    }
                    // 对方永远不会发送，只能由中止唤醒
                    let stream = cpu.stream_create().unwrap();
                    let mut buf = [0u8; 4];
                    ccl.recv(ptr(&mut buf), 4, DataType::Uint8, 0, &comm, &stream)
                        .unwrap();
                    boot.barrier().unwrap();
                    let e = cpu.stream_synchronize(&stream).unwrap_err();
                    assert_eq!(e.kind, ErrorKind::RemoteError);
                    let e = ccl.comm_get_async_error(&comm).unwrap().unwrap();
                    assert!(!ccl.get_last_error(&comm).is_empty());
                    ccl.comm_abort(comm).unwrap();
                    Some(e.kind)
                })
            })
            .collect::<Vec<_>>();
        let kinds = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(kinds, [ErrorKind::RemoteError]);
    }

    #[test]
    fn test_invalid() {
        run(Inproc::new(), 2, |_, ccl, comm, stream| {
            let mut buf = [0u8];
            let e = ccl
                .send(ptr(&mut buf), 1, DataType::Uint8, 2, comm, stream)
                .unwrap_err();
            assert_eq!(e.kind, ErrorKind::InvalidArgument);
            let e = ccl
                .all_gather(
                    DevPtr::null(),
                    ptr(&mut buf),
                    1,
                    DataType::Uint8,
                    comm,
                    stream,
                )
                .unwrap_err();
            assert_eq!(e.kind, ErrorKind::InvalidArgument);
        });
    }

    /// 只返回自己那一份数据的握手通道。
    struct Truncated;

    impl Bootstrap for Truncated {
        fn rank(&self) -> usize {
            0
        }
        fn nranks(&self) -> usize {
            2
        }
        fn barrier(&self) -> crate::Result<()> {
            Ok(())
        }
        fn send(&self, _peer: usize, _data: &[u8]) -> crate::Result<()> {
            Ok(())
        }
        fn recv(&self, _peer: usize) -> crate::Result<Vec<u8>> {
            unreachable!()
        }
        fn all_gather(&self, data: &[u8]) -> crate::Result<Vec<Vec<u8>>> {
            Ok(vec![data.to_vec()])
        }
    }

    #[test]
    fn test_truncated_bootstrap() {
        let e = Inproc::new()
            .comm_init_rank(2, &UniqueId::random(), 0, &Truncated)
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::InternalError);
    }
}
