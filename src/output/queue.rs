use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;

struct QueueInner<T> {
    items: VecDeque<T>,
    eos: bool,
}

/// 解码线程 -> 喂帧线程的队列；入队永不阻塞
pub struct OutputQueue<T> {
    inner: Mutex<QueueInner<T>>,
}

impl<T> Default for OutputQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OutputQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                eos: false,
            }),
        }
    }

    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        inner.eos = false;
        inner.items.push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// 按条件弹出队首
    pub fn pop_if(&self, f: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.items.front().is_some_and(f) {
            inner.items.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// 标记流结束；之后读空即为 EOS
    pub fn mark_eos(&self) {
        self.inner.lock().eos = true;
    }

    pub fn is_eos(&self) -> bool {
        let inner = self.inner.lock();
        inner.eos && inner.items.is_empty()
    }

    /// 丢弃所有数据，返回丢弃的数量
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.items.len();
        inner.items.clear();
        inner.eos = false;
        n
    }
}

/// 唤醒喂帧线程：单槽通道，满了说明已有未处理的唤醒
#[derive(Clone)]
pub struct Waker {
    tx: Sender<()>,
}

impl Waker {
    pub fn pair() -> (Waker, Receiver<()>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (Waker { tx }, rx)
    }

    pub fn wake(&self) {
        let _ = self.tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eos_only_when_drained_and_empty() {
        let q = OutputQueue::new();
        q.push(1);
        q.mark_eos();
        assert!(!q.is_eos());
        assert_eq!(q.pop(), Some(1));
        assert!(q.is_eos());
        q.push(2);
        assert!(!q.is_eos());
    }

    #[test]
    fn pop_if_leaves_head_in_place() {
        let q = OutputQueue::new();
        q.push(5);
        assert_eq!(q.pop_if(|&v| v > 10), None);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_if(|&v| v == 5), Some(5));
    }

    #[test]
    fn wakes_coalesce() {
        let (waker, rx) = Waker::pair();
        waker.wake();
        waker.wake();
        assert_eq!(rx.try_iter().count(), 1);
    }
}
