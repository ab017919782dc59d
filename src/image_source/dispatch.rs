//! # 调用方线程调度
//!
//! ## 设计思路
//!
//! 回调必须在调用方（UI）线程执行，但结果产生在后台线程。
//! 这里不假设任何全局“主线程”，而是由宿主注入一个 `Dispatcher`：
//! 后台把闭包交给它，由宿主决定在哪个线程上执行。
//!
//! `MainQueue` 是默认实现：后台通过 `MainQueueHandle` 投递，
//! 持有 `MainQueue` 的线程在自己的事件循环里调用 `run_pending` 执行。

use std::sync::mpsc;
use std::time::Duration;

/// 投递到调用方线程执行的任务。
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 把任务转交到调用方线程的能力。
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, job: Job);
}

/// 调用方线程上的任务队列。
///
/// # 示例
/// ```rust
/// use table_image_source::image_source::{Dispatcher, MainQueue};
///
/// let queue = MainQueue::new();
/// queue.handle().dispatch(Box::new(|| println!("on the caller thread")));
/// assert_eq!(queue.run_pending(), 1);
/// ```
pub struct MainQueue {
    sender: mpsc::Sender<Job>,
    receiver: mpsc::Receiver<Job>,
}

impl MainQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    /// 可跨线程共享的投递端。
    pub fn handle(&self) -> MainQueueHandle {
        MainQueueHandle {
            sender: self.sender.clone(),
        }
    }

    /// 执行当前已到达的全部任务，返回执行数量。
    pub fn run_pending(&self) -> usize {
        let mut executed = 0;
        while let Ok(job) = self.receiver.try_recv() {
            job();
            executed += 1;
        }
        executed
    }

    /// 最多等待 `timeout` 执行一个任务。
    pub fn run_next(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(job) => {
                job();
                true
            }
            Err(_) => false,
        }
    }
}

impl Default for MainQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct MainQueueHandle {
    sender: mpsc::Sender<Job>,
}

impl Dispatcher for MainQueueHandle {
    fn dispatch(&self, job: Job) {
        if self.sender.send(job).is_err() {
            log::debug!("调用方队列已关闭，丢弃回调");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn jobs_from_other_threads_run_on_the_draining_thread() {
        let queue = MainQueue::new();
        let handle = queue.handle();
        let caller = thread::current().id();
        let ran_on_caller = Arc::new(AtomicUsize::new(0));

        let ran = Arc::clone(&ran_on_caller);
        thread::spawn(move || {
            handle.dispatch(Box::new(move || {
                if thread::current().id() == caller {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            }));
        })
        .join()
        .expect("worker thread panicked");

        assert!(queue.run_next(Duration::from_secs(1)));
        assert_eq!(ran_on_caller.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_next_times_out_on_empty_queue() {
        let queue = MainQueue::new();
        assert!(!queue.run_next(Duration::from_millis(10)));
        assert_eq!(queue.run_pending(), 0);
    }

    #[test]
    fn dispatch_after_queue_dropped_is_ignored() {
        let queue = MainQueue::new();
        let handle = queue.handle();
        drop(queue);
        handle.dispatch(Box::new(|| {}));
    }
}
