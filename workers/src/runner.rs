use log::{debug, info};
use metrics::gauge;
use queue::Identifiable;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore, broadcast, mpsc, watch};
use tracing::Instrument;

/// Generic consume loop shared by the worker pools: drains a queue receiver,
/// runs the handler under a concurrency cap, and honors pause/shutdown
/// signals between items.
pub struct ProcessorRunner {
    pub name: String,
    pub shutdown_rx: broadcast::Receiver<()>,
    pub pause_rx: watch::Receiver<bool>,
    pub concurrency: usize,
}

impl ProcessorRunner {
    pub fn new(
        name: &str,
        shutdown_rx: broadcast::Receiver<()>,
        pause_rx: watch::Receiver<bool>,
        concurrency: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            shutdown_rx,
            pause_rx,
            concurrency,
        }
    }

    pub async fn run<T, F, Fut>(mut self, receiver: Arc<Mutex<mpsc::Receiver<T>>>, execute_fn: F)
    where
        T: Identifiable + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static + Clone,
        Fut: std::future::Future<Output = ()> + Send,
    {
        info!(
            "Starting {} processor with concurrency {}",
            self.name, self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let metric_label = self.name.to_lowercase();
        let mut rx = receiver.lock().await;

        let mut processed: u64 = 0;

        loop {
            if *self.pause_rx.borrow() {
                if self.pause_rx.changed().await.is_err() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("{} processor received shutdown signal", self.name);
                    break;
                }
                _ = self.pause_rx.changed() => {
                    continue;
                }
                item_opt = rx.recv() => {
                    match item_opt {
                        Some(item) => {
                            processed += 1;
                            if processed % 1000 == 0 {
                                debug!("Processor {}: processed {} items", self.name, processed);
                            }

                            let permit = tokio::select! {
                                _ = self.shutdown_rx.recv() => break,
                                res = semaphore.clone().acquire_owned() => {
                                    match res {
                                        Ok(p) => p,
                                        Err(_) => break,
                                    }
                                }
                            };

                            let execute_fn = execute_fn.clone();
                            let item_id = item.get_id();
                            let metric_label = metric_label.clone();
                            let span_name = format!("{}_processor", metric_label);

                            tokio::spawn(async move {
                                gauge!("worker_active_tasks", "processor" => metric_label.clone()).increment(1.0);
                                let _permit = permit;
                                execute_fn(item).await;
                                gauge!("worker_active_tasks", "processor" => metric_label).decrement(1.0);
                            }.instrument(tracing::info_span!("processor_execution", processor_type = %span_name, item_id = %item_id)));
                        }
                        None => {
                            info!("{} channel closed", self.name);
                            break;
                        }
                    }
                }
            }
        }

        info!("{} processor loop ended", self.name);
    }
}
