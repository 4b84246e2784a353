/*!
 * Runtime construction and background service lifecycle.
 *
 * Every background loop (sync engine, command dispatch, actuator tick) is
 * owned by a handle. Shutting a handle down waits for the loop to exit;
 * dropping it stops the loop as well, so a loop never outlives its owner.
 */
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::runtime::Builder as TokioRuntimeBuilder;
use tokio::runtime::Runtime as TokioRuntime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ExecutionModel, RuntimeConfig};
use crate::error::{Error, Result};

/// Build the tokio runtime for the configured execution model
///
/// The threaded model gets a multi-thread runtime; the cooperative model a
/// current-thread runtime on which every component is polled in turn.
pub fn build_runtime(config: &RuntimeConfig) -> Result<TokioRuntime> {
    let runtime = match config.execution_model {
        ExecutionModel::Threaded => {
            let mut builder = TokioRuntimeBuilder::new_multi_thread();
            if config.worker_threads > 0 {
                builder.worker_threads(config.worker_threads);
            }
            builder.enable_all().thread_name("starflow-worker").build()
        }
        ExecutionModel::Cooperative => TokioRuntimeBuilder::new_current_thread().enable_all().build(),
    }
    .map_err(|e| Error::runtime(format!("Failed to create Tokio runtime: {}", e)))?;

    info!(model = ?config.execution_model, "Created runtime");
    Ok(runtime)
}

/// Receiving side of a shutdown request
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Check whether shutdown was requested
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Wait until shutdown is requested or the handle is gone
    ///
    /// Cancel safe, so it can sit in a `tokio::select!` arm.
    pub async fn wait(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Owner of a background tokio task
#[derive(Debug)]
pub struct ServiceHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Spawn `service` on the current runtime and hand it a shutdown signal
    pub fn spawn<S, F, Fut>(name: S, service: F) -> Self
    where
        S: Into<String>,
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(service(ShutdownSignal(receiver)));
        debug!(service = %name, "Service started");
        Self {
            name,
            shutdown,
            task: Some(task),
        }
    }

    /// The service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether the service loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Request shutdown and wait for the loop to exit
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(service = %self.name, "Service ended abnormally: {}", e);
            }
        }
        debug!(service = %self.name, "Service stopped");
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.shutdown.send(true);
            task.abort();
        }
    }
}

/// Stop request shared with a service thread
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// Check whether the thread should exit
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Owner of a dedicated OS thread running a fixed-rate loop
#[derive(Debug)]
pub struct ThreadHandle {
    name: String,
    stop: StopFlag,
    thread: Option<thread::JoinHandle<()>>,
}

impl ThreadHandle {
    /// Spawn a named thread running `body` until its stop flag is set
    pub fn spawn<S, F>(name: S, body: F) -> Result<Self>
    where
        S: Into<String>,
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let name = name.into();
        let stop = StopFlag::default();
        let flag = stop.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(flag))?;
        debug!(service = %name, "Service thread started");
        Ok(Self {
            name,
            stop,
            thread: Some(thread),
        })
    }

    /// The thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the thread and wait for it to exit
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(service = %self.name, "Service thread panicked");
            }
            debug!(service = %self.name, "Service thread stopped");
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_build_both_models() {
        let threaded = RuntimeConfig {
            worker_threads: 2,
            ..RuntimeConfig::default()
        };
        let runtime = build_runtime(&threaded).unwrap();
        assert_eq!(runtime.block_on(async { 1 + 1 }), 2);

        let cooperative = RuntimeConfig {
            execution_model: ExecutionModel::Cooperative,
            ..RuntimeConfig::default()
        };
        let runtime = build_runtime(&cooperative).unwrap();
        assert_eq!(runtime.block_on(async { 3 }), 3);
    }

    #[tokio::test]
    async fn test_service_shutdown_waits_for_loop() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let handle = ServiceHandle::spawn("test", move |mut shutdown| async move {
            shutdown.wait().await;
            flag.store(true, Ordering::SeqCst);
        });

        assert!(!handle.is_finished());
        handle.shutdown().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_service_drop_stops_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = ServiceHandle::spawn("ticker", move |_shutdown| async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(handle);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let after_drop = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn test_thread_handle_drop_joins() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let counter = iterations.clone();
        let handle = ThreadHandle::spawn("tick-test", move |stop| {
            while !stop.is_stopped() {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        assert_eq!(handle.name(), "tick-test");

        std::thread::sleep(Duration::from_millis(10));
        drop(handle);
        let after_drop = iterations.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(iterations.load(Ordering::SeqCst), after_drop);
    }
}
