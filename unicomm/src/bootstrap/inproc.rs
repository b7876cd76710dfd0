use super::Bootstrap;
use crate::{
    inproc_node::{Channel, InprocNode, Mesh},
    invalid_argument, invalid_usage, system_error, Result, UniqueId,
};
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, OnceLock},
    time::Duration,
};

/// 同一进程内以线程为成员的握手。
///
/// 成员按 [`UniqueId`] 汇合，全部到齐之后 [`InprocBootstrap::join`] 才返回。
pub struct InprocBootstrap {
    node: InprocNode,
    timeout: Duration,
}

struct Room {
    nranks: usize,
    mesh: Arc<Mesh>,
    joined: Mutex<Vec<bool>>,
    cond: Condvar,
}

fn rooms() -> &'static Mutex<HashMap<UniqueId, Arc<Room>>> {
    static ROOMS: OnceLock<Mutex<HashMap<UniqueId, Arc<Room>>>> = OnceLock::new();
    ROOMS.get_or_init(Default::default)
}

impl InprocBootstrap {
    /// 以 `rank` 的身份加入 `id` 标识的组，等待全部 `nranks` 个成员到齐。
    ///
    /// - 同一个序号加入两次是 [`InvalidUsage`](crate::ErrorKind::InvalidUsage)；
    /// - 与先加入者的成员数不一致是 [`InvalidArgument`](crate::ErrorKind::InvalidArgument)；
    /// - `timeout` 内没有到齐是 [`SystemError`](crate::ErrorKind::SystemError)，
    ///   常见原因是有成员使用了不同的标识。
    pub fn join(id: &UniqueId, nranks: usize, rank: usize, timeout: Duration) -> Result<Self> {
        id.check()?;
        if rank >= nranks {
            return Err(invalid_argument(format!("rank {rank} out of {nranks}")));
        }

        let room = {
            let mut rooms = rooms().lock().unwrap();
            let room = rooms
                .entry(*id)
                .or_insert_with(|| {
                    Arc::new(Room {
                        nranks,
                        mesh: Mesh::new(nranks),
                        joined: Mutex::new(vec![false; nranks]),
                        cond: Condvar::new(),
                    })
                })
                .clone();
            if room.nranks != nranks {
                return Err(invalid_argument(format!(
                    "{id:?} has {} ranks, joined with {nranks}",
                    room.nranks
                )));
            }
            let mut joined = room.joined.lock().unwrap();
            if joined[rank] {
                return Err(invalid_usage(format!("rank {rank} joined {id:?} twice")));
            }
            joined[rank] = true;
            if joined.iter().all(|&b| b) {
                rooms.remove(id);
            }
            room.cond.notify_all();
            drop(joined);
            room
        };

        let (joined, _) = room
            .cond
            .wait_timeout_while(room.joined.lock().unwrap(), timeout, |joined| {
                !joined.iter().all(|&b| b)
            })
            .unwrap();
        if !joined.iter().all(|&b| b) {
            let count = joined.iter().filter(|&&b| b).count();
            drop(joined);
            room.leave(id, rank);
            return Err(system_error(format!(
                "bootstrap of {id:?} timed out with {count}/{nranks} ranks"
            )));
        }
        drop(joined);

        log::debug!("rank {rank}/{nranks} joined {id:?}");
        Ok(Self {
            node: InprocNode::new(rank, room.mesh.clone()),
            timeout,
        })
    }
}

impl Room {
    fn leave(self: &Arc<Self>, id: &UniqueId, rank: usize) {
        let mut rooms = rooms().lock().unwrap();
        let mut joined = self.joined.lock().unwrap();
        // 在持有锁之前恰好到齐的组不再拆散
        if joined.iter().all(|&b| b) {
            return;
        }
        joined[rank] = false;
        if joined.iter().all(|&b| !b)
            && rooms.get(id).is_some_and(|room| Arc::ptr_eq(room, self))
        {
            rooms.remove(id);
        }
    }
}

impl Bootstrap for InprocBootstrap {
    #[inline]
    fn rank(&self) -> usize {
        self.node.rank()
    }

    #[inline]
    fn nranks(&self) -> usize {
        self.node.group_size()
    }

    fn barrier(&self) -> Result<()> {
        let rank = self.rank();
        let nranks = self.nranks();
        for peer in (0..nranks).filter(|&peer| peer != rank) {
            self.node.send(peer, Channel::Barrier, Vec::new())?
        }
        for peer in (0..nranks).filter(|&peer| peer != rank) {
            self.node
                .recv_timeout(peer, Channel::Barrier, Some(self.timeout))?;
        }
        Ok(())
    }

    #[inline]
    fn send(&self, peer: usize, data: &[u8]) -> Result<()> {
        self.check_peer(peer)?;
        self.node.send(peer, Channel::Bootstrap, data.to_vec())
    }

    #[inline]
    fn recv(&self, peer: usize) -> Result<Vec<u8>> {
        self.check_peer(peer)?;
        self.node
            .recv_timeout(peer, Channel::Bootstrap, Some(self.timeout))
    }
}

impl InprocBootstrap {
    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer < self.nranks() {
            Ok(())
        } else {
            Err(invalid_argument(format!(
                "peer {peer} out of {}",
                self.nranks()
            )))
        }
    }
}

#[cfg(test)]
fn spawn_group(
    id: UniqueId,
    ranks: impl IntoIterator<Item = (usize, usize)>,
    timeout: Duration,
) -> Vec<Result<InprocBootstrap>> {
    ranks
        .into_iter()
        .map(|(nranks, rank)| {
            std::thread::spawn(move || InprocBootstrap::join(&id, nranks, rank, timeout))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect()
}

#[test]
fn test_all_gather() {
    let id = UniqueId::random();
    let timeout = Duration::from_secs(10);
    let results = (0..4)
        .map(|rank| {
            std::thread::spawn(move || {
                let boot = InprocBootstrap::join(&id, 4, rank, timeout).unwrap();
                boot.barrier().unwrap();
                let all = boot.all_gather(&[rank as u8; 2]).unwrap();
                boot.barrier().unwrap();
                all
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect::<Vec<_>>();
    for all in results {
        assert_eq!(all, [[0, 0], [1, 1], [2, 2], [3, 3]]);
    }
}

#[test]
fn test_duplicate_rank() {
    let id = UniqueId::random();
    let results = spawn_group(id, [(2, 0), (2, 0)], Duration::from_millis(200));
    let kinds = results
        .iter()
        .filter_map(|r| r.as_ref().err().map(|e| e.kind))
        .collect::<Vec<_>>();
    assert_eq!(kinds.len(), 2);
    assert!(kinds.contains(&crate::ErrorKind::InvalidUsage));
}

#[test]
fn test_mismatched_id() {
    let a = UniqueId::random();
    let b = UniqueId::random();
    let timeout = Duration::from_millis(100);
    let ha = std::thread::spawn(move || InprocBootstrap::join(&a, 2, 0, timeout));
    let hb = std::thread::spawn(move || InprocBootstrap::join(&b, 2, 1, timeout));
    for h in [ha, hb] {
        let e = h.join().unwrap().err().unwrap();
        assert_eq!(e.kind, crate::ErrorKind::SystemError);
    }
    // 超时的成员已经离开，同一个标识可以重新组建
    let results = spawn_group(a, [(2, 0), (2, 1)], Duration::from_secs(10));
    assert!(results.iter().all(Result::is_ok));
}

#[test]
fn test_malformed() {
    let e = InprocBootstrap::join(&UniqueId::default(), 1, 0, Duration::ZERO)
        .err()
        .unwrap();
    assert_eq!(e.kind, crate::ErrorKind::InvalidArgument);

    let id = UniqueId::random();
    let e = InprocBootstrap::join(&id, 2, 2, Duration::ZERO).err().unwrap();
    assert_eq!(e.kind, crate::ErrorKind::InvalidArgument);
}
