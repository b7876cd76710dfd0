use crate::{remote_error, system_error, Result};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

/// 消息所属的逻辑通道，不同通道的消息互不匹配。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) enum Channel {
    Bootstrap,
    Barrier,
    P2p,
    Coll,
}

/// 同一进程内一组线程之间的全连接消息网。
pub(crate) struct Mesh {
    mailboxes: Box<[Mailbox]>,
    aborted: AtomicBool,
}

#[derive(Default)]
struct Mailbox {
    queues: Mutex<HashMap<(usize, Channel), VecDeque<Vec<u8>>>>,
    cond: Condvar,
}

impl Mesh {
    pub fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            mailboxes: (0..n).map(|_| Mailbox::default()).collect(),
            aborted: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn group_size(&self) -> usize {
        self.mailboxes.len()
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(SeqCst)
    }

    /// 唤醒所有阻塞的接收者，此后的收发都失败。
    pub fn abort(&self) {
        self.aborted.store(true, SeqCst);
        for mailbox in &*self.mailboxes {
            let _guard = mailbox.queues.lock().unwrap();
            mailbox.cond.notify_all()
        }
    }
}

#[derive(Clone)]
pub(crate) struct InprocNode {
    rank: usize,
    mesh: Arc<Mesh>,
}

impl InprocNode {
    #[inline]
    pub fn new(rank: usize, mesh: Arc<Mesh>) -> Self {
        debug_assert!(rank < mesh.group_size());
        Self { rank, mesh }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn group_size(&self) -> usize {
        self.mesh.group_size()
    }

    #[inline]
    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// 发送不会阻塞，消息被立即放进对方的信箱。
    pub fn send(&self, peer: usize, channel: Channel, msg: Vec<u8>) -> Result<()> {
        if self.mesh.is_aborted() {
            return Err(remote_error("communicator aborted"));
        }
        let mailbox = &self.mesh.mailboxes[peer];
        mailbox
            .queues
            .lock()
            .unwrap()
            .entry((self.rank, channel))
            .or_default()
            .push_back(msg);
        mailbox.cond.notify_all();
        Ok(())
    }

    #[inline]
    pub fn recv(&self, peer: usize, channel: Channel) -> Result<Vec<u8>> {
        self.recv_timeout(peer, channel, None)
    }

    /// 按发送顺序接收 `peer` 在 `channel` 上的下一条消息。
    pub fn recv_timeout(
        &self,
        peer: usize,
        channel: Channel,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let key = (peer, channel);
        let mailbox = &self.mesh.mailboxes[self.rank];
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queues = mailbox.queues.lock().unwrap();
        loop {
            if let Some(msg) = queues.get_mut(&key).and_then(VecDeque::pop_front) {
                return Ok(msg);
            }
            if self.mesh.is_aborted() {
                return Err(remote_error(format!(
                    "communicator aborted while rank {} waits for rank {peer}",
                    self.rank
                )));
            }
            queues = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(system_error(format!(
                            "rank {} timed out waiting for rank {peer}",
                            self.rank
                        )));
                    }
                    mailbox.cond.wait_timeout(queues, deadline - now).unwrap().0
                }
                None => mailbox.cond.wait(queues).unwrap(),
            };
        }
    }
}

#[test]
fn test_fifo() {
    let mesh = Mesh::new(2);
    let a = InprocNode::new(0, mesh.clone());
    let b = InprocNode::new(1, mesh);

    a.send(1, Channel::P2p, vec![1]).unwrap();
    a.send(1, Channel::Coll, vec![9]).unwrap();
    a.send(1, Channel::P2p, vec![2]).unwrap();
    assert_eq!(b.recv(0, Channel::P2p).unwrap(), [1]);
    assert_eq!(b.recv(0, Channel::P2p).unwrap(), [2]);
    assert_eq!(b.recv(0, Channel::Coll).unwrap(), [9]);

    let e = b
        .recv_timeout(0, Channel::P2p, Some(Duration::from_millis(10)))
        .unwrap_err();
    assert_eq!(e.kind, crate::ErrorKind::SystemError);
}

#[test]
fn test_abort() {
    use std::thread;

    let mesh = Mesh::new(2);
    let waiter = {
        let node = InprocNode::new(1, mesh.clone());
        thread::spawn(move || node.recv(0, Channel::Coll))
    };
    thread::sleep(Duration::from_millis(10));
    mesh.abort();
    let e = waiter.join().unwrap().unwrap_err();
    assert_eq!(e.kind, crate::ErrorKind::RemoteError);
    assert!(InprocNode::new(0, mesh)
        .send(1, Channel::P2p, vec![])
        .is_err());
}
