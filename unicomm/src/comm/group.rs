use crate::{
    ccl::{CclAdaptor, InnerComm},
    device::Stream,
    DataType, DevPtr, ReduceOp, Result,
};

#[derive(Clone, Copy, Debug)]
pub(super) enum Coll {
    Broadcast { root: usize },
    Reduce { op: ReduceOp, root: usize },
    AllReduce { op: ReduceOp },
    ReduceScatter { op: ReduceOp },
    AllGather,
    Gather { root: usize },
    Scatter { root: usize },
    AllToAll,
    Send { peer: usize },
    Recv { peer: usize },
}

/// 一次集合通信调用的全部参数。
pub(super) struct CollOp {
    pub coll: Coll,
    pub send: DevPtr,
    pub recv: DevPtr,
    pub count: usize,
    pub dt: DataType,
    pub stream: Stream,
}

impl CollOp {
    pub fn issue(&self, ccl: &dyn CclAdaptor, comm: &InnerComm) -> Result<()> {
        let &Self {
            coll,
            send,
            recv,
            count,
            dt,
            ref stream,
        } = self;
        log::trace!("issue {coll:?} of {count} {dt:?}");
        match coll {
            Coll::Broadcast { root } => ccl.broadcast(send, recv, count, dt, root, comm, stream),
            Coll::Reduce { op, root } => ccl.reduce(send, recv, count, dt, op, root, comm, stream),
            Coll::AllReduce { op } => ccl.all_reduce(send, recv, count, dt, op, comm, stream),
            Coll::ReduceScatter { op } => {
                ccl.reduce_scatter(send, recv, count, dt, op, comm, stream)
            }
            Coll::AllGather => ccl.all_gather(send, recv, count, dt, comm, stream),
            Coll::Gather { root } => ccl.gather(send, recv, count, dt, root, comm, stream),
            Coll::Scatter { root } => ccl.scatter(send, recv, count, dt, root, comm, stream),
            Coll::AllToAll => ccl.alltoall(send, recv, count, dt, comm, stream),
            Coll::Send { peer } => ccl.send(send, count, dt, peer, comm, stream),
            Coll::Recv { peer } => ccl.recv(recv, count, dt, peer, comm, stream),
        }
    }
}

/// 分组期间暂存的调用。
#[derive(Default)]
pub(super) struct CommandBuffer {
    pub depth: usize,
    pub ops: Vec<CollOp>,
}

impl CommandBuffer {
    /// 按首次出现的顺序列出涉及的任务队列。
    pub fn streams(&self) -> Vec<Stream> {
        let mut ans = Vec::<Stream>::new();
        for op in &self.ops {
            if !ans.iter().any(|s| s.same_as(&op.stream)) {
                ans.push(op.stream.clone())
            }
        }
        ans
    }

    #[inline]
    pub fn clear(&mut self) {
        self.depth = 0;
        self.ops.clear()
    }
}
