use super::stream::{CpuStream, StreamState};
use crate::{CclError, Progress, Result};
use std::sync::{Arc, Mutex};

/// 记录任务队列在某一时刻已提交的任务数，队列执行到这个位置时事件完成。
#[derive(Default)]
pub struct CpuEvent(Mutex<Option<Mark>>);

#[derive(Clone)]
pub(super) struct Mark {
    state: Arc<StreamState>,
    seq: u64,
}

impl Mark {
    #[inline]
    pub fn wait(&self) {
        self.state.wait(self.seq)
    }

    /// 记录位置之前失败的任务的错误。
    #[inline]
    fn error(&self) -> Option<CclError> {
        self.state.error_before(self.seq)
    }
}

impl CpuEvent {
    pub(super) fn record(&self, stream: &CpuStream) {
        let state = stream.state().clone();
        let seq = state.submitted();
        *self.0.lock().unwrap() = Some(Mark { state, seq })
    }

    /// 未记录过的事件视为已完成。
    #[inline]
    pub(super) fn mark(&self) -> Option<Mark> {
        self.0.lock().unwrap().clone()
    }

    /// 等到记录的位置，之前有任务失败时返回它的错误。
    pub(super) fn synchronize(&self) -> Result<()> {
        match self.mark() {
            Some(mark) => {
                mark.wait();
                mark.error().map_or(Ok(()), Err)
            }
            None => Ok(()),
        }
    }

    pub(super) fn query(&self) -> Result<Progress> {
        let Some(mark) = self.mark() else {
            return Ok(Progress::Complete);
        };
        if let Some(e) = mark.error() {
            Err(e)
        } else if mark.state.reached(mark.seq) {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::InProgress)
        }
    }
}

#[test]
fn test_failed_before_record() {
    use crate::{unhandled_device_error, ErrorKind};

    let stream = CpuStream::new(0).unwrap();
    let before = CpuEvent::default();
    let after = CpuEvent::default();

    stream.enqueue(Box::new(|| Ok(()))).unwrap();
    before.record(&stream);
    stream
        .enqueue(Box::new(|| Err(unhandled_device_error("boom"))))
        .unwrap();
    after.record(&stream);

    before.synchronize().unwrap();
    assert_eq!(before.query().unwrap(), Progress::Complete);
    let e = after.synchronize().unwrap_err();
    assert_eq!(e.kind, ErrorKind::UnhandledDeviceError);
    assert_eq!(after.query().unwrap_err().kind, ErrorKind::UnhandledDeviceError);
}
