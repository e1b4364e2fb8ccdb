//! Invocable units of scheduled work.

use std::future::Future;

use async_trait::async_trait;

/// A unit of work fired by the schedule registry.
///
/// The registry knows nothing about what a job does; it only invokes it on
/// an independent task and records the outcome.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Human readable job identity shown in schedule listings.
    fn name(&self) -> &str;

    /// Execute the job once.
    async fn run(&self) -> anyhow::Result<()>;
}

/// A [`Job`] backed by an async closure.
pub struct FnJob<F> {
    name: String,
    func: F,
}

impl<F> std::fmt::Debug for FnJob<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnJob").field("name", &self.name).finish()
    }
}

/// Wrap an async closure as a named job.
///
/// ```rust,ignore
/// let job = job_fn("Say hello", || async {
///     tracing::info!("hello");
///     Ok(())
/// });
/// registry.add_job("*/5 * * * * *", "Greeting", Arc::new(job))?;
/// ```
pub fn job_fn<F, Fut>(name: impl Into<String>, func: F) -> FnJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnJob {
        name: name.into(),
        func,
    }
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> anyhow::Result<()> {
        (self.func)().await
    }
}
