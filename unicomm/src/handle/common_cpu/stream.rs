use crate::{internal_error, invalid_usage, system_error, CclError, Progress, Result};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        mpsc::{channel, Sender},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
};

/// 排在任务队列上的任务。
pub type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// 由一个工作线程按提交顺序执行任务的队列。
pub struct CpuStream {
    sender: Mutex<Option<Sender<Job>>>,
    state: Arc<StreamState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
pub(crate) struct StreamState {
    progress: Mutex<Counter>,
    cond: Condvar,
}

#[derive(Default)]
struct Counter {
    submitted: u64,
    completed: u64,
    /// 第一个失败的任务的位置和错误。
    error: Option<(u64, CclError)>,
}

impl StreamState {
    /// 等待前 `seq` 个任务完成。
    pub fn wait(&self, seq: u64) {
        let _guard = self
            .cond
            .wait_while(self.progress.lock().unwrap(), |p| p.completed < seq)
            .unwrap();
    }

    #[inline]
    pub fn reached(&self, seq: u64) -> bool {
        self.progress.lock().unwrap().completed >= seq
    }

    #[inline]
    pub fn submitted(&self) -> u64 {
        self.progress.lock().unwrap().submitted
    }

    /// 前 `seq` 个任务中第一个失败的任务的错误。
    pub fn error_before(&self, seq: u64) -> Option<CclError> {
        match &self.progress.lock().unwrap().error {
            Some((pos, e)) if *pos <= seq => Some(e.clone()),
            _ => None,
        }
    }

    pub fn synchronize(&self) -> Result<()> {
        let progress = self
            .cond
            .wait_while(self.progress.lock().unwrap(), |p| {
                p.completed < p.submitted
            })
            .unwrap();
        match &progress.error {
            Some((_, e)) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn query(&self) -> Result<Progress> {
        let progress = self.progress.lock().unwrap();
        if let Some((_, e)) = &progress.error {
            Err(e.clone())
        } else if progress.completed < progress.submitted {
            Ok(Progress::InProgress)
        } else {
            Ok(Progress::Complete)
        }
    }

    fn complete(&self, result: Result<()>) {
        let mut progress = self.progress.lock().unwrap();
        progress.completed += 1;
        if let Err(e) = result {
            log::debug!("stream job {} failed: {e}", progress.completed);
            let pos = progress.completed;
            progress.error.get_or_insert((pos, e));
        }
        self.cond.notify_all();
    }
}

impl CpuStream {
    pub(super) fn new(device: usize) -> Result<Self> {
        let (sender, receiver) = channel::<Job>();
        let state = Arc::new(StreamState::default());
        let worker = {
            let state = state.clone();
            thread::Builder::new()
                .name(format!("unicomm-stream-{device}"))
                .spawn(move || {
                    for job in receiver {
                        let result = catch_unwind(AssertUnwindSafe(job))
                            .unwrap_or_else(|_| Err(internal_error("stream job panicked")));
                        state.complete(result)
                    }
                })
                .map_err(|e| system_error(format!("spawn stream worker: {e}")))?
        };
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            state,
            worker: Mutex::new(Some(worker)),
        })
    }

    #[inline]
    pub(crate) fn state(&self) -> &Arc<StreamState> {
        &self.state
    }

    /// 提交任务，返回任务完成时队列到达的位置。
    pub fn enqueue(&self, job: Job) -> Result<u64> {
        let sender = self.sender.lock().unwrap();
        let Some(sender) = sender.as_ref() else {
            return Err(invalid_usage("stream is destroyed"));
        };
        let seq = {
            let mut progress = self.state.progress.lock().unwrap();
            progress.submitted += 1;
            progress.submitted
        };
        if sender.send(job).is_err() {
            self.state
                .complete(Err(internal_error("stream worker is gone")));
        }
        Ok(seq)
    }

    /// 清空队列并结束工作线程。
    ///
    /// 在工作线程自己的任务里调用时不等待，队列中剩下的任务照常执行完。
    pub(super) fn retire(&self) -> Result<()> {
        let on_worker = self
            .worker
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|w| w.thread().id() == thread::current().id());
        let result = if on_worker {
            Ok(())
        } else {
            self.state.synchronize()
        };
        drop(self.sender.lock().unwrap().take());
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if !on_worker {
                let _ = worker.join();
            }
        }
        result
    }
}

impl Drop for CpuStream {
    fn drop(&mut self) {
        if let Err(e) = self.retire() {
            log::warn!("stream dropped with error: {e}")
        }
    }
}

#[test]
fn test_order() {
    use std::time::Duration;

    let stream = CpuStream::new(0).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    for i in 0..8 {
        let log = log.clone();
        stream
            .enqueue(Box::new(move || {
                thread::sleep(Duration::from_millis((8 - i) as _));
                log.lock().unwrap().push(i);
                Ok(())
            }))
            .unwrap();
    }
    stream.state().synchronize().unwrap();
    assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
    assert_eq!(stream.state().query().unwrap(), Progress::Complete);
}

#[test]
fn test_sticky_error() {
    use crate::unhandled_device_error;

    let stream = CpuStream::new(0).unwrap();
    stream
        .enqueue(Box::new(|| Err(unhandled_device_error("boom"))))
        .unwrap();
    stream.enqueue(Box::new(|| Ok(()))).unwrap();
    assert!(stream.state().synchronize().is_err());
    assert!(stream.state().query().is_err());

    stream.retire().unwrap_err();
    assert!(stream.enqueue(Box::new(|| Ok(()))).is_err());
}

#[test]
fn test_retire_from_worker() {
    use std::time::Duration;

    let stream = Arc::new(CpuStream::new(0).unwrap());
    let state = stream.state().clone();
    let (tx, rx) = channel();
    {
        let held = stream.clone();
        stream
            .enqueue(Box::new(move || {
                let _ = rx.recv();
                drop(held);
                Ok(())
            }))
            .unwrap();
    }
    stream.enqueue(Box::new(|| Ok(()))).unwrap();
    // 最后一个引用在工作线程的任务里释放
    drop(stream);
    tx.send(()).unwrap();

    let (done, wait) = channel();
    thread::spawn(move || done.send(state.synchronize()).unwrap());
    wait.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
}
