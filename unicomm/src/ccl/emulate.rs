//! 以点对点收发组合出的集合通信。
//!
//! 每个操作包在一组 `group_start`/`group_end` 之内，比原生实现多一轮同步，
//! 延迟随成员数增长，只在后端没有原生实现时使用。

use super::{CclAdaptor, InnerComm};
use crate::{device::Stream, invalid_argument, DataType, DevPtr, Result};

/// 在一组之内执行 `f`，无论 `f` 是否成功都结束这一组。
fn grouped<C: CclAdaptor + ?Sized>(ccl: &C, f: impl FnOnce() -> Result<()>) -> Result<()> {
    ccl.group_start()?;
    let ans = f();
    let end = ccl.group_end();
    ans.and(end)
}

fn check_root(root: usize, nranks: usize) -> Result<()> {
    if root < nranks {
        Ok(())
    } else {
        Err(invalid_argument(format!("root {root} out of {nranks}")))
    }
}

#[allow(clippy::too_many_arguments)]
pub fn gather<C: CclAdaptor + ?Sized>(
    ccl: &C,
    send: DevPtr,
    recv: DevPtr,
    count: usize,
    dt: DataType,
    root: usize,
    comm: &InnerComm,
    stream: &Stream,
) -> Result<()> {
    let rank = ccl.comm_user_rank(comm)?;
    let nranks = ccl.comm_count(comm)?;
    check_root(root, nranks)?;
    let size = dt.nbytes(count);
    grouped(ccl, || {
        if rank == root {
            for peer in 0..nranks {
                ccl.recv(recv.byte_add(peer * size), count, dt, peer, comm, stream)?
            }
        }
        ccl.send(send, count, dt, root, comm, stream)
    })
}

#[allow(clippy::too_many_arguments)]
pub fn scatter<C: CclAdaptor + ?Sized>(
    ccl: &C,
    send: DevPtr,
    recv: DevPtr,
    count: usize,
    dt: DataType,
    root: usize,
    comm: &InnerComm,
    stream: &Stream,
) -> Result<()> {
    let rank = ccl.comm_user_rank(comm)?;
    let nranks = ccl.comm_count(comm)?;
    check_root(root, nranks)?;
    let size = dt.nbytes(count);
    grouped(ccl, || {
        if rank == root {
            for peer in 0..nranks {
                ccl.send(send.byte_add(peer * size), count, dt, peer, comm, stream)?
            }
        }
        ccl.recv(recv, count, dt, root, comm, stream)
    })
}

pub fn alltoall<C: CclAdaptor + ?Sized>(
    ccl: &C,
    send: DevPtr,
    recv: DevPtr,
    count: usize,
    dt: DataType,
    comm: &InnerComm,
    stream: &Stream,
) -> Result<()> {
    let nranks = ccl.comm_count(comm)?;
    let size = dt.nbytes(count);
    grouped(ccl, || {
        for peer in 0..nranks {
            ccl.send(send.byte_add(peer * size), count, dt, peer, comm, stream)?;
            ccl.recv(recv.byte_add(peer * size), count, dt, peer, comm, stream)?
        }
        Ok(())
    })
}
