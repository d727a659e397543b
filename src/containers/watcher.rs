//! Initial scan plus event-stream follow over a `ContainerRuntime`, with
//! automatic resubscription on stream failure (§4.9).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::containers::runtime::{ContainerEvent, ContainerEventType, ContainerRuntime};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub type EventHandler = Arc<dyn Fn(ContainerEvent) + Send + Sync>;

pub struct Watcher {
    runtime: Arc<dyn ContainerRuntime>,
    label_prefix: String,
    handler: EventHandler,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, label_prefix: impl Into<String>, handler: EventHandler) -> Self {
        Self {
            runtime,
            label_prefix: label_prefix.into(),
            handler,
            stopped: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Idempotent: a second call while already running is a no-op.
    pub async fn start(&self) -> anyhow::Result<()> {
        {
            let task = self.task.lock().expect("watcher task lock poisoned");
            if task.is_some() {
                return Ok(());
            }
        }

        for container in self.runtime.list_enabled(&self.label_prefix).await? {
            (self.handler)(ContainerEvent {
                event_type: ContainerEventType::Start,
                container_id: container.id,
                container_name: container.name,
                labels: container.labels,
            });
        }

        let runtime = self.runtime.clone();
        let label_prefix = self.label_prefix.clone();
        let handler = self.handler.clone();
        let stopped = self.stopped.clone();
        let stop_notify = self.stop_notify.clone();

        let handle = tokio::spawn(async move {
            loop {
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                let mut stream = runtime.events(&label_prefix);
                loop {
                    tokio::select! {
                        next = stream.next() => {
                            match next {
                                Some(Ok(event)) => handler(event),
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "container event stream error, reconnecting");
                                    break;
                                }
                                None => {
                                    tracing::warn!("container event stream closed, reconnecting");
                                    break;
                                }
                            }
                        }
                        _ = stop_notify.notified() => return,
                    }
                }
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = stop_notify.notified() => return,
                }
            }
        });

        *self.task.lock().expect("watcher task lock poisoned") = Some(handle);
        Ok(())
    }

    /// Signal the watch loop to exit and block until it has.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        let handle = self.task.lock().expect("watcher task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::runtime::{ContainerNetworks, EventStream, RunningContainer};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct FakeRuntime {
        initial: Vec<RunningContainer>,
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn list_enabled(&self, _label_prefix: &str) -> anyhow::Result<Vec<RunningContainer>> {
            Ok(self.initial.clone())
        }

        fn events(&self, _label_prefix: &str) -> EventStream {
            Box::pin(futures::stream::pending())
        }

        async fn inspect(&self, _container_id: &str) -> anyhow::Result<(String, ContainerNetworks)> {
            Ok((String::new(), ContainerNetworks::default()))
        }
    }

    #[tokio::test]
    async fn initial_scan_synthesizes_start_events() {
        let runtime = Arc::new(FakeRuntime {
            initial: vec![RunningContainer {
                id: "c1".to_string(),
                name: "web".to_string(),
                labels: HashMap::new(),
            }],
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handler: EventHandler = Arc::new(move |event| {
            seen_clone.lock().unwrap().push(event.container_id);
        });

        let watcher = Watcher::new(runtime, "devproxy", handler);
        watcher.start().await.unwrap();
        watcher.stop().await;

        assert_eq!(*seen.lock().unwrap(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let runtime = Arc::new(FakeRuntime { initial: Vec::new() });
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let handler: EventHandler = Arc::new(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let watcher = Watcher::new(runtime, "devproxy", handler);
        watcher.start().await.unwrap();
        watcher.start().await.unwrap();
        watcher.stop().await;
    }
}
