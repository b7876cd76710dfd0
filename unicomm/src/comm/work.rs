use crate::{
    device::{DeviceRuntime, Event},
    Progress, Result,
};
use std::{fmt, sync::Arc};

/// 一批分组提交的集合通信的完成句柄。
///
/// 每个涉及的任务队列上记录一个事件，所有事件完成时这一批操作完成。
pub struct Work {
    device: Arc<dyn DeviceRuntime>,
    events: Vec<Event>,
}

impl Work {
    pub(super) fn new(device: Arc<dyn DeviceRuntime>, events: Vec<Event>) -> Self {
        Self { device, events }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// 阻塞到这一批操作全部完成。
    pub fn wait(&self) -> Result<()> {
        self.events
            .iter()
            .try_for_each(|e| self.device.event_synchronize(e))
    }

    pub fn query(&self) -> Result<Progress> {
        for event in &self.events {
            if self.device.event_query(event)? == Progress::InProgress {
                return Ok(Progress::InProgress);
            }
        }
        Ok(Progress::Complete)
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Work")
            .field("device", &self.device.name())
            .field("events", &self.events)
            .finish()
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        for event in self.events.drain(..) {
            if let Err(e) = self.device.event_destroy(event) {
                log::warn!("failed to release event: {e}")
            }
        }
    }
}
