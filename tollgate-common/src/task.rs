use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{stream::FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};

use crate::shutdown::Shutdown;

/// Errors that can occur when joining [`NamedTask`]s.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Long-lived task finished prematurely: {name}")]
    PrematureFinish { name: Cow<'static, str> },
    #[error("Some tasks failed to finish on time: {hung_tasks:?}")]
    Hung { hung_tasks: Vec<String> },
}

/// A thin wrapper around [`tokio::task::JoinHandle`] that:
///
/// (1) propagates panics instead of catching them, and
/// (2) adds `#[must_use]` so spawned tasks are joined or explicitly
///     detached, and
/// (3) carries a task name for debuggability.
///
/// The goal is structured concurrency: the application root owns a handle
/// to every long-lived task and joins them all at shutdown, so panics
/// propagate and nothing leaks. [`NamedTask::detach`] exists but should be
/// used sparingly.
#[must_use]
pub struct NamedTask<T> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T> NamedTask<T> {
    /// Spawns a named task which inherits from the current [`tracing`] span.
    pub fn spawn<F>(
        name: impl Into<Cow<'static, str>>,
        future: F,
    ) -> NamedTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        Self::spawn_with_span(name, tracing::Span::current(), future)
    }

    /// Spawns a named task instrumented with a custom span.
    pub fn spawn_with_span<F>(
        name: impl Into<Cow<'static, str>>,
        span: tracing::Span,
        future: F,
    ) -> NamedTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        NamedTask {
            handle: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// Drop the handle, detaching the task so it continues running in the
    /// background. Without a handle the output (or panic) can no longer be
    /// observed.
    #[inline]
    pub fn detach(self) {
        std::mem::drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    #[inline]
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wraps the task so its join result is logged when it finishes and
    /// its output is mapped to the task's name. Panics still propagate.
    pub fn logged(self) -> LoggedTask<T> {
        LoggedTask(self)
    }
}

/// A [`NamedTask`] whose join result is logged when it finishes; the
/// [`Future::Output`] is mapped to the task's name.
pub struct LoggedTask<T>(NamedTask<T>);

impl<T> LoggedTask<T> {
    #[inline]
    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl<T> Future for LoggedTask<T> {
    type Output = Cow<'static, str>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            let name = self.0.name.clone();
            match result {
                Ok(_) => info!("Task '{name}' finished"),
                Err(join_err) if join_err.is_cancelled() =>
                    warn!("Task '{name}' cancelled"),
                Err(join_err) => warn!("Task '{name}' failed: {join_err:#}"),
            }
            name
        })
    }
}

impl<T> Future for NamedTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = match result {
            Ok(val) => Ok(val),
            Err(join_err) => match join_err.try_into_panic() {
                // Propagate the panic to the poller.
                Ok(panic_reason) => {
                    error!("Task '{name}' panicked!", name = self.name());
                    std::panic::resume_unwind(panic_reason)
                }
                Err(join_err) => Err(join_err),
            },
        };

        Poll::Ready(result)
    }
}

/// The application root's standard join loop.
///
/// - All `tasks` are expected to run until shutdown; if any finishes early,
///   a shutdown is triggered and an error is returned.
/// - After the shutdown signal, waits up to `shutdown_timeout` for the
///   remaining tasks to complete; hung tasks are reported by name.
/// - All handles are polled so panics propagate to the caller.
pub async fn try_join_until_shutdown(
    tasks: Vec<NamedTask<()>>,
    shutdown: Shutdown,
    shutdown_timeout: Duration,
) -> Result<(), Error> {
    if tasks.is_empty() {
        let _ = shutdown.wait().await;
        return Ok(());
    }

    let mut tasks = tasks
        .into_iter()
        .map(NamedTask::logged)
        .collect::<FuturesUnordered<_>>();

    let mut result = Ok(());

    tokio::select! {
        // Mitigate possible select! race after a shutdown trigger
        biased;
        reason = shutdown.wait() => info!("Draining tasks: {reason}"),
        Some(name) = tasks.next() => {
            // A long-lived task finished prematurely. Trigger a shutdown
            // and wait on the remaining tasks.
            shutdown.trigger(format!("task '{name}' finished prematurely"));
            result = Err(Error::PrematureFinish { name });
        }
    }

    let shutdown_timeout_fut = tokio::time::sleep(shutdown_timeout);
    tokio::pin!(shutdown_timeout_fut);

    while !tasks.is_empty() {
        tokio::select! {
            Some(_name) = tasks.next() => (),
            () = &mut shutdown_timeout_fut => {
                let hung_tasks = tasks
                    .iter()
                    .map(|task| task.name().to_owned())
                    .collect::<Vec<_>>();
                return Err(Error::Hung { hung_tasks });
            }
        }
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn joins_after_shutdown() {
        let shutdown = Shutdown::new();
        let task =
            NamedTask::spawn("waiter", shutdown.clone().wait_owned());

        let join_fut = try_join_until_shutdown(
            vec![task],
            shutdown.clone(),
            Duration::from_secs(1),
        );
        shutdown.trigger("test over");
        join_fut.await.expect("Tasks should have joined cleanly");
    }

    #[tokio::test(start_paused = true)]
    async fn premature_finish_is_an_error() {
        let shutdown = Shutdown::new();
        let task = NamedTask::spawn("early-bird", async {});

        let result = try_join_until_shutdown(
            vec![task],
            shutdown.clone(),
            Duration::from_secs(1),
        )
        .await;

        match result {
            Err(Error::PrematureFinish { name }) =>
                assert_eq!(name, "early-bird"),
            other => panic!("Expected PrematureFinish, got {other:?}"),
        }
        // The premature finish is also what triggered the shutdown.
        assert_eq!(
            shutdown.reason().as_deref(),
            Some("task 'early-bird' finished prematurely"),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_task_is_reported() {
        let shutdown = Shutdown::new();
        let hung = NamedTask::spawn("hung", async {
            std::future::pending::<()>().await;
        });

        shutdown.trigger("test");
        let result = try_join_until_shutdown(
            vec![hung],
            shutdown,
            Duration::from_secs(1),
        )
        .await;

        match result {
            Err(Error::Hung { hung_tasks }) =>
                assert_eq!(hung_tasks, vec!["hung".to_owned()]),
            other => panic!("Expected Hung, got {other:?}"),
        }
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn panics_propagate() {
        let task = NamedTask::spawn("bomb", async {
            panic!("boom");
        });
        let _ = task.await;
    }
}
