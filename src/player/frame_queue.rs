//! 解码线程与消费线程之间的帧队列
//!
//! 单生产者 / 单消费者。容量是软上限：`push` 不阻塞，生产者通过 `wait_space_for`
//! 自行限流。禁用的队列对消费者表现为空，所有阻塞调用立即返回，用于 flush / close
//! 时唤醒被阻塞的线程。

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct QueueInner<T> {
    items: VecDeque<T>,
    enabled: bool,
    eof: bool,
}

pub struct FrameQueue<T> {
    inner: Mutex<QueueInner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                enabled: true,
                eof: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // ========================================================================
    // 生产者 API（解码线程）
    // ========================================================================

    /// 非阻塞推入，队列被禁用时丢弃并返回 false
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return false;
        }
        inner.items.push_back(item);
        self.not_empty.notify_all();
        true
    }

    /// 队列满时最多等待 `timeout`，返回是否有空间
    pub fn wait_space_for(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.enabled && inner.items.len() >= self.capacity {
            self.not_full.wait_for(&mut inner, timeout);
        }
        inner.items.len() < self.capacity
    }

    /// 标记流结束：消费者取完剩余帧后得到 None
    pub fn mark_eof(&self) {
        let mut inner = self.inner.lock();
        inner.eof = true;
        self.not_empty.notify_all();
    }

    /// 唤醒阻塞在 `wait_space_for` 上的生产者（配合中断标志使用）
    pub fn wake_producers(&self) {
        let _inner = self.inner.lock();
        self.not_full.notify_all();
    }

    // ========================================================================
    // 消费者 API
    // ========================================================================

    /// 取出队首帧。`blocking` 为 true 时等待，直到有数据、流结束或队列被禁用。
    /// 禁用的队列即使还有帧也返回 None。
    pub fn remove(&self, blocking: bool) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if !inner.enabled {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if !blocking || inner.eof {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// 阻塞取帧，同时每隔 `poll` 检查一次外部中断标志
    pub fn remove_interruptible(&self, interrupt: &AtomicBool, poll: Duration) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if !inner.enabled {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.eof || interrupt.load(Ordering::SeqCst) {
                return None;
            }
            self.not_empty.wait_for(&mut inner, poll);
        }
    }

    /// 查看队首帧而不取出
    pub fn front<R>(&self, blocking: bool, view: impl FnOnce(&T) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        loop {
            if !inner.enabled {
                return None;
            }
            if let Some(item) = inner.items.front() {
                return Some(view(item));
            }
            if !blocking || inner.eof {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// 带中断检查的阻塞查看
    pub fn front_interruptible<R>(
        &self,
        interrupt: &AtomicBool,
        poll: Duration,
        view: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        loop {
            if !inner.enabled {
                return None;
            }
            if let Some(item) = inner.items.front() {
                return Some(view(item));
            }
            if inner.eof || interrupt.load(Ordering::SeqCst) {
                return None;
            }
            self.not_empty.wait_for(&mut inner, poll);
        }
    }

    /// 丢弃队首满足条件的帧，`dispose` 负责释放每个被丢弃的帧，返回丢弃数量
    pub fn skip_while(
        &self,
        mut predicate: impl FnMut(&T) -> bool,
        mut dispose: impl FnMut(T),
    ) -> usize {
        let mut inner = self.inner.lock();
        let mut skipped = 0;
        while inner.items.front().map_or(false, &mut predicate) {
            if let Some(item) = inner.items.pop_front() {
                dispose(item);
                skipped += 1;
            }
        }
        if skipped > 0 {
            self.not_full.notify_all();
        }
        skipped
    }

    // ========================================================================
    // 控制
    // ========================================================================

    /// 启用 / 禁用队列；禁用会唤醒所有阻塞的线程。重复调用无副作用。
    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        inner.enabled = enabled;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// 清空队列并撤销流结束标记，返回清除的帧数
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.items.len();
        inner.items.clear();
        inner.eof = false;
        self.not_full.notify_all();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// 生产者已标记流结束（可能仍有剩余帧）
    pub fn is_eof(&self) -> bool {
        self.inner.lock().eof
    }

    /// 已标记结束且没有剩余帧
    pub fn is_finished(&self) -> bool {
        let inner = self.inner.lock();
        inner.eof && inner.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order_and_peek() {
        let queue = FrameQueue::new(8);
        for i in 0..3 {
            assert!(queue.push(i));
        }
        assert_eq!(queue.front(false, |v| *v), Some(0));
        assert_eq!(queue.remove(false), Some(0));
        assert_eq!(queue.remove(false), Some(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_non_blocking_remove_on_empty() {
        let queue: FrameQueue<u32> = FrameQueue::new(4);
        assert_eq!(queue.remove(false), None);
        assert_eq!(queue.front(false, |v| *v), None);
    }

    #[test]
    fn test_skip_while_disposes_each_frame() {
        let queue = FrameQueue::new(8);
        for pts in [0.1, 0.2, 0.3, 0.4] {
            queue.push(pts);
        }
        let mut disposed = Vec::new();
        let skipped = queue.skip_while(|pts| *pts < 0.25, |pts| disposed.push(pts));
        assert_eq!(skipped, 2);
        assert_eq!(disposed, vec![0.1, 0.2]);
        assert_eq!(queue.remove(false), Some(0.3));
    }

    #[test]
    fn test_eof_drains_remaining_frames_first() {
        let queue = FrameQueue::new(4);
        queue.push(1);
        queue.mark_eof();
        assert!(!queue.is_finished());
        assert_eq!(queue.remove(true), Some(1));
        assert_eq!(queue.remove(true), None);
        assert!(queue.is_finished());
        queue.clear();
        assert!(!queue.is_finished());
    }

    #[test]
    fn test_disable_wakes_all_blocked_consumers() {
        let queue: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::new(4));
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = queue.clone();
                thread::spawn(move || q.remove(true))
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        queue.set_enabled(false);
        queue.set_enabled(false);

        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!queue.push(7));
    }

    #[test]
    fn test_wake_producers_ends_space_wait() {
        let queue = Arc::new(FrameQueue::new(1));
        queue.push(0);

        let producer = {
            let q = queue.clone();
            thread::spawn(move || q.wait_space_for(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        queue.wake_producers();
        assert!(!producer.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_producer_resumes_when_consumer_drains() {
        let queue = Arc::new(FrameQueue::new(1));
        queue.push(0);

        let consumer = {
            let q = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                q.remove(true)
            })
        };
        assert!(queue.wait_space_for(Duration::from_secs(5)));
        assert_eq!(consumer.join().unwrap(), Some(0));
    }

    #[test]
    fn test_disabled_queue_hides_remaining_frames() {
        let queue = FrameQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.set_enabled(false);

        let flag = AtomicBool::new(false);
        assert_eq!(queue.remove(true), None);
        assert_eq!(queue.front(true, |v| *v), None);
        assert_eq!(queue.remove_interruptible(&flag, Duration::from_millis(5)), None);
        assert_eq!(queue.front_interruptible(&flag, Duration::from_millis(5), |v| *v), None);
        assert_eq!(queue.len(), 2);

        queue.set_enabled(true);
        assert_eq!(queue.remove(false), Some(1));
    }

    #[test]
    fn test_remove_interruptible_returns_on_flag() {
        let queue: FrameQueue<u8> = FrameQueue::new(2);
        let flag = AtomicBool::new(true);
        assert_eq!(queue.remove_interruptible(&flag, Duration::from_millis(5)), None);
    }
}
