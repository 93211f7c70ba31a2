use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

type FlushFn<T> = Box<dyn Fn(Vec<T>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Size- and time-bounded write coalescer. Items accumulate until either the
/// batch size is reached or the flush interval elapses, then the callback
/// runs with everything buffered so far. Remaining items are flushed when the
/// producer side closes.
pub struct BatchBuffer<T> {
    sender: mpsc::Sender<T>,
}

struct Batcher<T> {
    buffer: Vec<T>,
    batch_size: usize,
    flush: FlushFn<T>,
}

impl<T> Batcher<T> {
    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        (self.flush)(batch).await;
    }

    async fn push(&mut self, item: T) {
        self.buffer.push(item);
        if self.buffer.len() >= self.batch_size {
            self.flush().await;
        }
    }
}

impl<T> BatchBuffer<T>
where
    T: Send + 'static,
{
    pub fn new<F, Fut>(
        capacity: usize,
        batch_size: usize,
        flush_interval: Duration,
        flush_callback: F,
    ) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::channel(capacity);
        let mut batcher = Batcher {
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            flush: Box::new(move |items| Box::pin(flush_callback(items))),
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    item = receiver.recv() => {
                        match item {
                            Some(item) => batcher.push(item).await,
                            None => {
                                batcher.flush().await;
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        batcher.flush().await;
                    }
                }
            }
        });

        Self { sender }
    }

    pub async fn add(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        self.sender.send(item).await
    }
}
