//! Lifecycle shared by every GPU-owned object.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::{GalError, GalResult};
use crate::state::{QueueKind, SubmissionToken};

/// Unique identifier for a GPU resource within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ResourceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Atomic once-flag guarding native teardown.
#[derive(Debug, Default)]
pub struct DisposeOnce(AtomicBool);

impl DisposeOnce {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn is_disposed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns true exactly once, for the caller that must release native handles.
    pub fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

/// Latest submission on each queue that referenced a resource.
#[derive(Debug, Default)]
pub(crate) struct UsageFence([AtomicU64; QueueKind::COUNT]);

impl UsageFence {
    pub fn record(&self, token: SubmissionToken) {
        self.0[token.queue.index()].fetch_max(token.value, Ordering::AcqRel);
    }

    pub fn pending(&self) -> impl Iterator<Item = SubmissionToken> + '_ {
        QueueKind::ALL.into_iter().filter_map(|queue| {
            let value = self.0[queue.index()].load(Ordering::Acquire);
            (value != 0).then_some(SubmissionToken { queue, value })
        })
    }
}

/// State common to buffers, textures, samplers, shaders, layouts, sets, pipelines and
/// acceleration structures.
#[derive(Debug)]
pub struct ResourceBase {
    id: ResourceId,
    kind: &'static str,
    name: RwLock<Option<String>>,
    disposed: DisposeOnce,
    pub(crate) usage: UsageFence,
}

impl ResourceBase {
    pub(crate) fn new(kind: &'static str, label: Option<&str>) -> Self {
        Self {
            id: ResourceId::next(),
            kind,
            name: RwLock::new(label.map(str::to_owned)),
            disposed: DisposeOnce::new(),
            usage: UsageFence::default(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn name(&self) -> Option<String> {
        self.name.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write().unwrap_or_else(|e| e.into_inner()) = Some(name.to_owned());
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_disposed()
    }

    pub(crate) fn begin_dispose(&self) -> bool {
        self.disposed.begin()
    }

    /// Fails with `InvalidState` once the resource has been disposed.
    pub fn ensure_alive(&self) -> GalResult<()> {
        if self.is_disposed() {
            return Err(GalError::InvalidState(format!(
                "{} {} used after dispose",
                self.kind,
                self.describe()
            )));
        }
        Ok(())
    }

    pub(crate) fn describe(&self) -> String {
        match self.name() {
            Some(name) => format!("'{name}'"),
            None => format!("#{}", self.id.0),
        }
    }
}

/// Common surface of every object handed out by the resource factory.
pub trait Resource: Send + Sync + std::fmt::Debug {
    fn base(&self) -> &ResourceBase;

    /// Releases the native handle. Idempotent; never fails.
    fn dispose(&self);

    /// Tags the resource for debuggers and validation messages.
    fn set_name(&self, name: &str);

    fn id(&self) -> ResourceId {
        self.base().id()
    }

    fn name(&self) -> Option<String> {
        self.base().name()
    }

    fn is_disposed(&self) -> bool {
        self.base().is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispose_once_fires_once() {
        let flag = DisposeOnce::new();
        assert!(!flag.is_disposed());
        assert!(flag.begin());
        assert!(!flag.begin());
        assert!(flag.is_disposed());
    }

    #[test]
    fn usage_fence_keeps_latest_value_per_queue() {
        let fence = UsageFence::default();
        fence.record(SubmissionToken { queue: QueueKind::Graphics, value: 4 });
        fence.record(SubmissionToken { queue: QueueKind::Graphics, value: 2 });
        fence.record(SubmissionToken { queue: QueueKind::Transfer, value: 1 });
        let pending: Vec<_> = fence.pending().collect();
        assert_eq!(
            pending,
            vec![
                SubmissionToken { queue: QueueKind::Graphics, value: 4 },
                SubmissionToken { queue: QueueKind::Transfer, value: 1 },
            ]
        );
    }

    #[test]
    fn base_reports_use_after_dispose() {
        let base = ResourceBase::new("buffer", Some("vertices"));
        assert!(base.ensure_alive().is_ok());
        assert!(base.begin_dispose());
        let err = base.ensure_alive().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid state: buffer 'vertices' used after dispose"
        );
    }
}
