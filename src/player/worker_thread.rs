use crate::core::{PlayerError, Result};
use crate::player::log_ctx;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{info, warn};
use std::thread::{self, JoinHandle, ThreadId};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// 工作线程命令
enum ThreadCommand {
    Run(Task),
    Stop,
}

/// 专用工作线程：按提交顺序在同一线程上执行任务
///
/// - `post()` 异步提交，立即返回
/// - `call()` 同步提交，等待任务执行完毕并取回结果
///
/// 长时间运行的任务（如解码循环）会阻塞后续任务，同步调用因此可以作为
/// “前一个任务已经退出”的屏障。
pub struct WorkerThread {
    name: String,
    thread_id: ThreadId,
    thread_handle: Option<JoinHandle<()>>,
    command_tx: Sender<ThreadCommand>,
}

impl WorkerThread {
    /// 启动工作线程
    pub fn start(name: &str) -> Result<Self> {
        let (command_tx, command_rx) = unbounded::<ThreadCommand>();
        let thread_name = name.to_string();

        let thread_handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || Self::run_loop(&thread_name, command_rx))?;

        Ok(Self {
            name: name.to_string(),
            thread_id: thread_handle.thread().id(),
            thread_handle: Some(thread_handle),
            command_tx,
        })
    }

    /// 任务循环（在独立线程中运行）
    fn run_loop(name: &str, command_rx: Receiver<ThreadCommand>) {
        info!("{} 🎬 工作线程启动: {}", log_ctx(), name);
        let mut executed: usize = 0;

        while let Ok(command) = command_rx.recv() {
            match command {
                ThreadCommand::Run(task) => {
                    task();
                    executed += 1;
                }
                ThreadCommand::Stop => {
                    info!("{} ⏹ 工作线程收到停止命令: {}", log_ctx(), name);
                    break;
                }
            }
        }

        info!("{} 🛑 工作线程退出: {}（共执行 {} 个任务）", log_ctx(), name, executed);
    }

    /// 当前是否运行在该工作线程上
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// 异步提交任务
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.thread_handle.is_none() {
            return Err(PlayerError::Disconnected("工作线程已停止"));
        }
        self.command_tx
            .send(ThreadCommand::Run(Box::new(task)))
            .map_err(|_| PlayerError::Disconnected("工作线程已退出"))
    }

    /// 同步提交任务并等待结果；在工作线程内部调用时直接执行
    pub fn call<R: Send + 'static>(&self, task: impl FnOnce() -> R + Send + 'static) -> Result<R> {
        if self.is_current() {
            return Ok(task());
        }
        let (reply_tx, reply_rx) = bounded::<R>(1);
        self.post(move || {
            let _ = reply_tx.send(task());
        })?;
        reply_rx
            .recv()
            .map_err(|_| PlayerError::Disconnected("工作线程未返回结果"))
    }

    /// 停止线程：已提交的任务执行完毕后退出，并 join
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            info!("{} 🛑 WorkerThread::stop(): {}", log_ctx(), self.name);
            let _ = self.command_tx.send(ThreadCommand::Stop);
            if handle.thread().id() == thread::current().id() {
                warn!("{} ⚠ 在工作线程内部停止自身，跳过 join", log_ctx());
                return;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!("{} ⚠ WorkerThread 被 drop，但未调用 stop()，正在尝试优雅停止", log_ctx());
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_tasks_run_in_order_on_worker() {
        let worker = WorkerThread::start("test-worker").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let counter = counter.clone();
            worker
                .post(move || {
                    assert_eq!(counter.fetch_add(1, Ordering::SeqCst), i);
                })
                .unwrap();
        }
        let on_worker = worker.call(|| thread::current().name().map(str::to_string)).unwrap();
        assert_eq!(on_worker.as_deref(), Some("test-worker"));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_call_acts_as_barrier() {
        let worker = Arc::new(WorkerThread::start("barrier").unwrap());
        let done = Arc::new(AtomicUsize::new(0));
        {
            let done = done.clone();
            worker
                .post(move || {
                    thread::sleep(std::time::Duration::from_millis(30));
                    done.store(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        worker.call(|| ()).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_post_after_stop_fails() {
        let mut worker = WorkerThread::start("stopped").unwrap();
        worker.stop();
        worker.stop();
        assert!(matches!(worker.post(|| ()), Err(PlayerError::Disconnected(_))));
    }
}
