use super::{
    group::{complete, done, post, Post},
    reduce::fold,
};
use crate::{
    inproc_node::{Channel, InprocNode},
    invalid_usage, DataType, DevPtr, ReduceOp, Result,
};

#[inline]
fn read(ptr: DevPtr, size: usize) -> Vec<u8> {
    unsafe { ptr.as_slice(size) }.to_vec()
}

fn write(dst: DevPtr, size: usize, msg: &[u8]) -> Result<()> {
    if msg.len() != size {
        return Err(invalid_usage(format!(
            "received {} bytes, {size} bytes expected",
            msg.len()
        )));
    }
    unsafe { dst.as_slice_mut(size) }.copy_from_slice(msg);
    Ok(())
}

fn peers(node: &InprocNode) -> impl Iterator<Item = usize> {
    let rank = node.rank();
    (0..node.group_size()).filter(move |&peer| peer != rank)
}

/// 按序号收集所有成员的消息，自己的部分直接使用 `own`。
fn collect(node: &InprocNode, own: Vec<u8>) -> Result<Vec<Vec<u8>>> {
    let mut own = Some(own);
    (0..node.group_size())
        .map(|peer| {
            if peer == node.rank() {
                Ok(own.take().unwrap_or_default())
            } else {
                node.recv(peer, Channel::Coll)
            }
        })
        .collect()
}

fn fold_into(
    dst: DevPtr,
    size: usize,
    parts: &[Vec<u8>],
    dt: DataType,
    op: ReduceOp,
) -> Result<()> {
    if let Some(part) = parts.iter().find(|p| p.len() != size) {
        return Err(invalid_usage(format!(
            "received {} bytes, {size} bytes expected",
            part.len()
        )));
    }
    fold(
        unsafe { dst.as_slice_mut(size) },
        parts.iter().map(Vec::as_slice),
        dt,
        op,
    );
    Ok(())
}

pub(super) fn broadcast(
    node: InprocNode,
    send: DevPtr,
    recv: DevPtr,
    size: usize,
    root: usize,
) -> Post {
    post(move || {
        if node.rank() == root {
            let msg = read(send, size);
            for peer in peers(&node) {
                node.send(peer, Channel::Coll, msg.clone())?
            }
            if send != recv {
                write(recv, size, &msg)?
            }
            done()
        } else {
            Ok(complete(move || {
                write(recv, size, &node.recv(root, Channel::Coll)?)
            }))
        }
    })
}

pub(super) fn reduce(
    node: InprocNode,
    send: DevPtr,
    recv: DevPtr,
    size: usize,
    dt: DataType,
    op: ReduceOp,
    root: usize,
) -> Post {
    post(move || {
        let own = read(send, size);
        if node.rank() != root {
            node.send(root, Channel::Coll, own)?;
            done()
        } else {
            Ok(complete(move || {
                fold_into(recv, size, &collect(&node, own)?, dt, op)
            }))
        }
    })
}

pub(super) fn all_reduce(
    node: InprocNode,
    send: DevPtr,
    recv: DevPtr,
    size: usize,
    dt: DataType,
    op: ReduceOp,
) -> Post {
    post(move || {
        let own = read(send, size);
        for peer in peers(&node) {
            node.send(peer, Channel::Coll, own.clone())?
        }
        Ok(complete(move || {
            fold_into(recv, size, &collect(&node, own)?, dt, op)
        }))
    })
}

/// `size` 是每个成员得到的字节数。
pub(super) fn reduce_scatter(
    node: InprocNode,
    send: DevPtr,
    recv: DevPtr,
    size: usize,
    dt: DataType,
    op: ReduceOp,
) -> Post {
    post(move || {
        for peer in peers(&node) {
            node.send(peer, Channel::Coll, read(send.byte_add(peer * size), size))?
        }
        let own = read(send.byte_add(node.rank() * size), size);
        Ok(complete(move || {
            fold_into(recv, size, &collect(&node, own)?, dt, op)
        }))
    })
}

/// `size` 是每个成员贡献的字节数。
pub(super) fn all_gather(node: InprocNode, send: DevPtr, recv: DevPtr, size: usize) -> Post {
    post(move || {
        let rank = node.rank();
        let msg = read(send, size);
        for peer in peers(&node) {
            node.send(peer, Channel::Coll, msg.clone())?
        }
        write(recv.byte_add(rank * size), size, &msg)?;
        Ok(complete(move || {
            for peer in peers(&node) {
                let msg = node.recv(peer, Channel::Coll)?;
                write(recv.byte_add(peer * size), size, &msg)?
            }
            Ok(())
        }))
    })
}

pub(super) fn gather(
    node: InprocNode,
    send: DevPtr,
    recv: DevPtr,
    size: usize,
    root: usize,
) -> Post {
    post(move || {
        let own = read(send, size);
        if node.rank() != root {
            node.send(root, Channel::Coll, own)?;
            done()
        } else {
            Ok(complete(move || {
                for (peer, msg) in collect(&node, own)?.into_iter().enumerate() {
                    write(recv.byte_add(peer * size), size, &msg)?
                }
                Ok(())
            }))
        }
    })
}

pub(super) fn scatter(
    node: InprocNode,
    send: DevPtr,
    recv: DevPtr,
    size: usize,
    root: usize,
) -> Post {
    post(move || {
        if node.rank() == root {
            for peer in peers(&node) {
                node.send(peer, Channel::Coll, read(send.byte_add(peer * size), size))?
            }
            write(recv, size, &read(send.byte_add(root * size), size))?;
            done()
        } else {
            Ok(complete(move || {
                write(recv, size, &node.recv(root, Channel::Coll)?)
            }))
        }
    })
}

/// `size` 是每对成员之间交换的字节数。
pub(super) fn alltoall(node: InprocNode, send: DevPtr, recv: DevPtr, size: usize) -> Post {
    post(move || {
        for peer in peers(&node) {
            node.send(peer, Channel::Coll, read(send.byte_add(peer * size), size))?
        }
        let own = read(send.byte_add(node.rank() * size), size);
        Ok(complete(move || {
            write(recv.byte_add(node.rank() * size), size, &own)?;
            for peer in peers(&node) {
                let msg = node.recv(peer, Channel::Coll)?;
                write(recv.byte_add(peer * size), size, &msg)?
            }
            Ok(())
        }))
    })
}

pub(super) fn send(node: InprocNode, buf: DevPtr, size: usize, peer: usize) -> Post {
    post(move || {
        node.send(peer, Channel::P2p, read(buf, size))?;
        done()
    })
}

pub(super) fn recv(node: InprocNode, buf: DevPtr, size: usize, peer: usize) -> Post {
    post(move || {
        Ok(complete(move || {
            write(buf, size, &node.recv(peer, Channel::P2p)?)
        }))
    })
}
