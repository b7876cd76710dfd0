//! 以线程为单位的分组提交。
//!
//! 每个任务分为两步：发出（只发送、不阻塞）和完成（接收、归约）。
//! 一组任务在同一个任务队列上先全部发出再依次完成，组内收发的顺序因此不会造成死锁。

use super::Shared;
use crate::{common_cpu::CpuStream, device::Stream, invalid_usage, Result};
use std::{cell::RefCell, iter::zip, mem::take, sync::Arc};

pub(super) type Complete = Box<dyn FnOnce() -> Result<()> + Send + 'static>;
pub(super) type Post = Box<dyn FnOnce() -> Result<Complete> + Send + 'static>;

#[inline]
pub(super) fn post(f: impl FnOnce() -> Result<Complete> + Send + 'static) -> Post {
    Box::new(f)
}

#[inline]
pub(super) fn complete(f: impl FnOnce() -> Result<()> + Send + 'static) -> Complete {
    Box::new(f)
}

#[inline]
pub(super) fn done() -> Result<Complete> {
    Ok(complete(|| Ok(())))
}

pub(super) struct Task {
    comm: Arc<Shared>,
    post: Post,
}

impl Task {
    #[inline]
    pub fn new(comm: &Arc<Shared>, post: Post) -> Self {
        Self {
            comm: comm.clone(),
            post,
        }
    }
}

#[derive(Default)]
struct Group {
    depth: usize,
    tasks: Vec<(Stream, Task)>,
}

thread_local! {
    static GROUP: RefCell<Group> = RefCell::new(Group::default());
}

#[inline]
pub(super) fn start() {
    GROUP.with_borrow_mut(|group| group.depth += 1)
}

pub(super) fn end() -> Result<()> {
    let tasks = GROUP.with_borrow_mut(|group| {
        if group.depth == 0 {
            return Err(invalid_usage("group_end without group_start"));
        }
        group.depth -= 1;
        Ok(if group.depth == 0 {
            take(&mut group.tasks)
        } else {
            Vec::new()
        })
    })?;
    if tasks.is_empty() {
        return Ok(());
    }

    let mut batches = Vec::<(Stream, Vec<Task>)>::new();
    for (stream, task) in tasks {
        match batches.iter_mut().find(|(s, _)| s.same_as(&stream)) {
            Some((_, batch)) => batch.push(task),
            None => batches.push((stream, vec![task])),
        }
    }
    log::debug!(
        "flush group of {} tasks on {} streams",
        batches.iter().map(|(_, b)| b.len()).sum::<usize>(),
        batches.len()
    );
    batches
        .into_iter()
        .try_for_each(|(stream, tasks)| enqueue(&stream, tasks))
}

/// 在组内时暂存任务，否则立即提交。
pub(super) fn submit(stream: &Stream, task: Task) -> Result<()> {
    stream.native::<CpuStream>()?;
    let task = GROUP.with_borrow_mut(|group| {
        if group.depth > 0 {
            group.tasks.push((stream.clone(), task));
            None
        } else {
            Some(task)
        }
    });
    match task {
        Some(task) => enqueue(stream, vec![task]),
        None => Ok(()),
    }
}

fn enqueue(stream: &Stream, tasks: Vec<Task>) -> Result<()> {
    let batch = Batch::new(tasks);
    stream
        .native::<CpuStream>()?
        .enqueue(Box::new(move || batch.run()))
        .map(drop)
}

/// 排在任务队列上的一批任务，存在期间计入通信域的未完成任务数。
struct Batch {
    comms: Vec<Arc<Shared>>,
    posts: Vec<Post>,
}

impl Batch {
    fn new(tasks: Vec<Task>) -> Self {
        let (comms, posts): (Vec<_>, Vec<_>) =
            tasks.into_iter().map(|t| (t.comm, t.post)).unzip();
        for comm in &comms {
            comm.begin()
        }
        Self { comms, posts }
    }

    fn run(mut self) -> Result<()> {
        let posts = take(&mut self.posts);
        let mut completes = Vec::with_capacity(posts.len());
        for (comm, post) in zip(&self.comms, posts) {
            match post() {
                Ok(complete) => completes.push((comm, complete)),
                Err(e) => {
                    comm.fail(e.clone());
                    return Err(e);
                }
            }
        }
        for (comm, complete) in completes {
            if let Err(e) = complete() {
                comm.fail(e.clone());
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        for comm in &self.comms {
            comm.end()
        }
    }
}
