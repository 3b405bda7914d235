use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::warn;

use crate::app::error::AppError;

/// Queue key used for commands that are not addressed to a device. They all
/// serialize through this single key.
pub const DEFAULT_QUEUE_KEY: &str = "default";

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<String, AppError>;
}

struct PendingCommand {
    command: String,
    responder: oneshot::Sender<Result<String, AppError>>,
}

struct QueueInner {
    executor: Arc<dyn CommandExecutor>,
    queues: Mutex<HashMap<String, VecDeque<PendingCommand>>>,
}

/// FIFO command queues keyed by device id. At most one command per key is in
/// flight; a failing command resolves its own submitter and never stalls the
/// rest of the queue.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl CommandQueue {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                executor,
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn submit(
        &self,
        command: impl Into<String>,
        key: &str,
    ) -> Result<String, AppError> {
        let (responder, receiver) = oneshot::channel();
        let should_start = {
            let mut queues = self.inner.lock();
            let queue = queues.entry(key.to_string()).or_default();
            queue.push_back(PendingCommand {
                command: command.into(),
                responder,
            });
            queue.len() == 1
        };

        if should_start {
            let inner = Arc::clone(&self.inner);
            let key = key.to_string();
            tokio::spawn(async move {
                inner.drain(&key).await;
            });
        }

        receiver
            .await
            .unwrap_or_else(|_| Err(AppError::system("Command queue dropped the request", "")))
    }
}

impl QueueInner {
    async fn drain(&self, key: &str) {
        loop {
            // The head entry stays queued while in flight so new submissions
            // see a busy queue.
            let command = {
                let queues = self.lock();
                let Some(front) = queues.get(key).and_then(|queue| queue.front()) else {
                    return;
                };
                front.command.clone()
            };

            let full_command = if key == DEFAULT_QUEUE_KEY {
                command
            } else {
                format!("-s {key} {command}")
            };

            let result = self.executor.execute(&full_command).await;

            let (finished, more) = {
                let mut queues = self.lock();
                let Some(queue) = queues.get_mut(key) else {
                    return;
                };
                let finished = queue.pop_front();
                let more = !queue.is_empty();
                if !more {
                    queues.remove(key);
                }
                (finished, more)
            };

            if let Some(entry) = finished {
                if entry.responder.send(result).is_err() {
                    warn!(key, "command submitter went away before the result arrived");
                }
            }

            if !more {
                return;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<PendingCommand>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fake executor that records submission order and concurrent depth.
    struct RecordingExecutor {
        executed: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_on: Option<String>,
    }

    impl RecordingExecutor {
        fn new(fail_on: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                executed: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail_on: fail_on.map(|value| value.to_string()),
            })
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(&self, command: &str) -> Result<String, AppError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.executed.lock().unwrap().push(command.to_string());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(fail_on) = &self.fail_on {
                if command.contains(fail_on.as_str()) {
                    return Err(AppError::device("boom", "test"));
                }
            }
            Ok(format!("ok: {command}"))
        }
    }

    #[tokio::test]
    async fn commands_for_one_device_run_in_submission_order() {
        let executor = RecordingExecutor::new(None);
        let queue = CommandQueue::new(executor.clone());

        // join_all polls the futures in order, so enqueue order is the vec
        // order: submission order is deterministic here.
        let submissions = (0..8)
            .map(|index| queue.submit(format!("shell echo {index}"), "dev1"))
            .collect::<Vec<_>>();
        for result in futures_util::future::join_all(submissions).await {
            result.expect("command");
        }

        let executed = executor.executed.lock().unwrap().clone();
        assert_eq!(executed.len(), 8);
        for (index, command) in executed.iter().enumerate() {
            assert_eq!(command, &format!("-s dev1 shell echo {index}"));
        }
        assert_eq!(executor.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_failing_command_does_not_stall_the_queue() {
        let executor = RecordingExecutor::new(Some("bad"));
        let queue = CommandQueue::new(executor.clone());

        let first = queue.submit("shell bad", "dev1");
        let second = queue.submit("shell good", "dev1");
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_err());
        assert_eq!(second.expect("second command"), "ok: -s dev1 shell good");
    }

    #[tokio::test]
    async fn different_devices_drain_independently() {
        let executor = RecordingExecutor::new(None);
        let queue = CommandQueue::new(executor.clone());

        let a = queue.submit("shell reboot", "dev-a");
        let b = queue.submit("shell reboot", "dev-b");
        let (a, b) = tokio::join!(a, b);
        a.expect("dev-a");
        b.expect("dev-b");

        let executed = executor.executed.lock().unwrap().clone();
        assert_eq!(executed.len(), 2);
    }

    #[tokio::test]
    async fn default_key_commands_are_not_device_prefixed() {
        let executor = RecordingExecutor::new(None);
        let queue = CommandQueue::new(executor.clone());

        queue
            .submit("devices -l", DEFAULT_QUEUE_KEY)
            .await
            .expect("command");

        let executed = executor.executed.lock().unwrap().clone();
        assert_eq!(executed, vec!["devices -l".to_string()]);
    }
}
