/// A unit of work shipped between execution contexts.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Opaque tag identifying the event-loop "domain" a job belongs to.
///
/// Runtimes that track per-request context hand one out from
/// [`Runtime::current_domain_tag`] and restore it when the job posted with it
/// runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainTag(pub u64);

/// Host runtime capability: a blocking worker pool next to the
/// single-threaded event-loop context that owns every connection.
///
/// The adapter touches the engine only on the event-loop context. The one
/// exception is delegated-task draining, which it ships to
/// [`Runtime::submit_blocking`] and resumes via
/// [`Runtime::post_to_event_loop`].
pub trait Runtime: Send + Sync {
    /// Submits a job to the blocking worker pool.
    fn submit_blocking(&self, job: Job);

    /// Posts a job onto the event-loop context. `tag` restores the domain
    /// that was current when the work was initiated.
    fn post_to_event_loop(&self, job: Job, tag: Option<DomainTag>);

    /// The domain tag of the currently executing event-loop turn, if the
    /// runtime tracks one.
    fn current_domain_tag(&self) -> Option<DomainTag> {
        None
    }
}
