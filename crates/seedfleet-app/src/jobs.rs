use async_trait::async_trait;

/// An external-collaborator job slot on the scheduler.
///
/// The promotion-feed (magic) watcher and the Netcup throttle monitor live
/// outside this repository; the scheduler only needs something it can poll
/// every minute under the usual single-flight discipline.
#[async_trait]
pub trait CollaboratorJob: Send + Sync {
    /// Job name for logs.
    fn name(&self) -> &'static str;

    /// Whether the job wants to run at all right now.
    async fn enabled(&self) -> bool {
        true
    }

    /// One run. Failures are contained at the job boundary.
    async fn run(&self) -> anyhow::Result<()>;
}
