use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::broker::{Broker, Delivery, Topic};
use crate::error::{BrokerError, WorkerError};
use crate::retry::RetryPolicy;

/// How a handled delivery is settled with the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Return for redelivery after the pool's redelivery backoff.
    Nack,
    /// Poison message; move to the dead-letter topic.
    DeadLetter(String),
}

/// Processes deliveries from one topic. Shared by all threads of a pool.
pub trait DeliveryHandler: Send + Sync + 'static {
    fn topic(&self) -> Topic;
    fn handle(&self, delivery: &Delivery) -> Disposition;
}

/// Fixed-size pool of OS threads consuming one broker topic.
///
/// A nacked delivery stays in flight for `redelivery.backoff_for(attempt)`
/// before it is handed back to the broker, so a failing dependency is
/// retried with backoff instead of in a tight loop.
pub struct WorkerPool {
    name: String,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn start(
        name: &str,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn DeliveryHandler>,
        worker_count: usize,
        receive_timeout: Duration,
        redelivery: RetryPolicy,
    ) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(format!(
                "{}: worker_count must be > 0",
                name
            )));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let broker = Arc::clone(&broker);
            let handler = Arc::clone(&handler);
            let shutdown_flag = Arc::clone(&shutdown);
            let redelivery = redelivery.clone();
            let label = format!("{}-{}", name, worker_id);

            let handle = thread::Builder::new()
                .name(label.clone())
                .spawn(move || {
                    run_worker(
                        &label,
                        broker,
                        handler,
                        shutdown_flag,
                        receive_timeout,
                        &redelivery,
                    );
                })
                .map_err(|e| {
                    // Stop the threads already running before bailing out.
                    shutdown.store(true, Ordering::Relaxed);
                    WorkerError::SpawnFailed(format!("{}: {}", name, e))
                })?;

            workers.push(handle);
        }

        info!("Started {} {} workers", worker_count, name);

        Ok(Self {
            name: name.to_string(),
            workers,
            shutdown,
        })
    }

    pub fn shutdown(&self) {
        info!("Shutting down {} workers...", self.name);
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Signals shutdown and joins every thread.
    pub fn wait(self) {
        self.shutdown.store(true, Ordering::Relaxed);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("{} worker {} panicked: {:?}", self.name, i, e);
            } else {
                debug!("{} worker {} finished", self.name, i);
            }
        }

        info!("All {} workers have stopped", self.name);
    }
}

fn run_worker(
    label: &str,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn DeliveryHandler>,
    shutdown: Arc<AtomicBool>,
    receive_timeout: Duration,
    redelivery: &RetryPolicy,
) {
    debug!("Worker {} started", label);
    let topic = handler.topic();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", label);
            break;
        }

        match broker.receive(topic, receive_timeout) {
            Ok(Some(delivery)) => {
                let disposition = handler.handle(&delivery);
                if disposition == Disposition::Nack {
                    let delay = redelivery.backoff_for(delivery.attempt);
                    debug!(
                        "Worker {} returning delivery {} (attempt {}) in {:?}",
                        label, delivery.id, delivery.attempt, delay
                    );
                    hold(&shutdown, delay, receive_timeout);
                }
                settle(broker.as_ref(), &delivery, disposition);
            }
            Ok(None) => continue,
            Err(BrokerError::ChannelClosed(_)) => {
                debug!("Worker {} topic {} closed", label, topic);
                break;
            }
            Err(e) => {
                warn!("Worker {} failed to receive from {}: {}", label, topic, e);
                thread::sleep(receive_timeout);
            }
        }
    }

    debug!("Worker {} stopped", label);
}

/// Sleeps for `delay`, waking every `tick` to check the shutdown flag.
fn hold(shutdown: &AtomicBool, delay: Duration, tick: Duration) {
    let deadline = Instant::now() + delay;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(tick));
    }
}

fn settle(broker: &dyn Broker, delivery: &Delivery, disposition: Disposition) {
    let result = match disposition {
        Disposition::Ack => broker.ack(delivery),
        Disposition::Nack => broker.nack(delivery),
        Disposition::DeadLetter(reason) => broker
            .dead_letter(delivery, &reason)
            .or_else(|e| {
                warn!("Dead-lettering delivery {} failed, returning it: {}", delivery.id, e);
                broker.nack(delivery)
            }),
    };
    if let Err(e) = result {
        error!("Failed to settle delivery {} on {}: {}", delivery.id, delivery.topic, e);
    }
}
