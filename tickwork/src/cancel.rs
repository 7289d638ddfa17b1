//! Cooperative cancellation.
//!
//! A [`CancellationTokenSource`] owns the cancellation state; any number of
//! [`CancellationToken`]s observe it. Cancellation is never pushed to
//! observers: tasks and bodies poll the token at their decision points, and
//! deadlines are evaluated lazily the first time a token is read past them.
use crate::clock::Clock;
use crate::task::TaskError;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

const CANNOT_BE_CANCELLED: u8 = 0;
const NOT_CANCELLED: u8 = 1;
const CANCELLED: u8 = 2;

const NO_DEADLINE: u64 = u64::MAX;

static ALWAYS_CANCELLED: LazyLock<Arc<SourceInner>> =
    LazyLock::new(|| Arc::new(SourceInner::new(CANCELLED, None, SmallVec::new())));

static NEVER_CANCELLABLE: LazyLock<Arc<SourceInner>> = LazyLock::new(|| {
    Arc::new(SourceInner::new(
        CANNOT_BE_CANCELLED,
        None,
        SmallVec::new(),
    ))
});

struct SourceInner {
    state: AtomicU8,

    // Absolute deadline in clock milliseconds, `NO_DEADLINE` when unarmed.
    deadline: AtomicU64,

    clock: Option<Arc<dyn Clock>>,

    // Linked sources report cancellation when any parent does.
    parents: SmallVec<[CancellationToken; 2]>,
}

impl SourceInner {
    fn new(
        state: u8,
        clock: Option<Arc<dyn Clock>>,
        parents: SmallVec<[CancellationToken; 2]>,
    ) -> Self {
        Self {
            state: AtomicU8::new(state),
            deadline: AtomicU64::new(NO_DEADLINE),
            clock,
            parents,
        }
    }

    fn cancel(&self) -> bool {
        self.state
            .compare_exchange(
                NOT_CANCELLED,
                CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn is_cancellation_requested(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            CANCELLED => true,
            CANNOT_BE_CANCELLED => false,
            _ => {
                if self.deadline_passed() || self.parents.iter().any(|p| p.is_cancellation_requested())
                {
                    // Lazy upgrade. Losing the race to another observer or to
                    // an explicit `cancel` lands in the same state.
                    self.cancel();
                    true
                } else {
                    false
                }
            }
        }
    }

    fn arm(&self, clock: &dyn Clock, delay_ms: u64) {
        let deadline = clock.now_ms().saturating_add(delay_ms).min(NO_DEADLINE - 1);
        self.deadline.store(deadline, Ordering::Release);
    }

    fn deadline_passed(&self) -> bool {
        let deadline = self.deadline.load(Ordering::Acquire);
        if deadline == NO_DEADLINE {
            return false;
        }

        self.clock
            .as_ref()
            .is_some_and(|clock| clock.now_ms() >= deadline)
    }

    fn can_be_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) != CANNOT_BE_CANCELLED
    }
}

/// The owner side of a cancellation signal.
#[derive(Clone)]
pub struct CancellationTokenSource {
    inner: Arc<SourceInner>,
}

impl CancellationTokenSource {
    /// A source that can only be cancelled explicitly through [`cancel`].
    ///
    /// [`cancel`]: CancellationTokenSource::cancel
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SourceInner::new(NOT_CANCELLED, None, SmallVec::new())),
        }
    }

    /// A source able to carry a deadline measured on `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(SourceInner::new(
                NOT_CANCELLED,
                Some(clock),
                SmallVec::new(),
            )),
        }
    }

    /// A source that cancels itself once `clock` reaches `now + delay_ms`.
    /// A zero delay yields a source that is already cancelled.
    pub fn with_timeout(clock: Arc<dyn Clock>, delay_ms: u64) -> Self {
        let source = Self::with_clock(clock.clone());
        if delay_ms == 0 {
            source.cancel();
        } else {
            source.inner.arm(clock.as_ref(), delay_ms);
        }
        source
    }

    /// A source which reports cancellation when it is cancelled itself or when
    /// any of `parents` is.
    pub fn linked<I>(parents: I) -> Self
    where
        I: IntoIterator<Item = CancellationToken>,
    {
        let parents = parents
            .into_iter()
            .filter(|p| p.can_be_cancelled())
            .collect();

        Self {
            inner: Arc::new(SourceInner::new(NOT_CANCELLED, None, parents)),
        }
    }

    /// The shared source that is cancelled from the start.
    pub fn always_cancelled() -> Self {
        Self {
            inner: Arc::clone(&ALWAYS_CANCELLED),
        }
    }

    /// The shared source that can never be cancelled. Calling [`cancel`] on it
    /// has no effect.
    ///
    /// [`cancel`]: CancellationTokenSource::cancel
    pub fn never_cancellable() -> Self {
        Self {
            inner: Arc::clone(&NEVER_CANCELLABLE),
        }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            source: Some(Arc::clone(&self.inner)),
        }
    }

    /// Requests cancellation. Returns `true` if this call performed the
    /// transition.
    pub fn cancel(&self) -> bool {
        let cancelled = self.inner.cancel();
        if cancelled {
            tracing::trace!("cancellation requested");
        }
        cancelled
    }

    /// Arms (or re-arms) the deadline `delay_ms` from now.
    ///
    /// A zero delay cancels immediately and needs no clock; any other delay
    /// requires a source created with a clock.
    pub fn cancel_after(&self, delay_ms: u64) -> Result<(), TaskError> {
        if delay_ms == 0 {
            self.cancel();
            return Ok(());
        }

        let clock = self.inner.clock.as_ref().ok_or(TaskError::MissingClock)?;
        self.inner.arm(clock.as_ref(), delay_ms);
        Ok(())
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.inner.is_cancellation_requested()
    }

    /// The absolute deadline, if one is armed.
    pub fn deadline_ms(&self) -> Option<u64> {
        match self.inner.deadline.load(Ordering::Acquire) {
            NO_DEADLINE => None,
            deadline => Some(deadline),
        }
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationTokenSource")
            .field("cancelled", &self.is_cancellation_requested())
            .field("deadline_ms", &self.deadline_ms())
            .finish()
    }
}

/// A read-only observer of a [`CancellationTokenSource`].
///
/// The default token has no source and is never cancelled.
#[derive(Clone, Default)]
pub struct CancellationToken {
    source: Option<Arc<SourceInner>>,
}

impl CancellationToken {
    /// A token that is never cancelled.
    pub fn none() -> Self {
        Self { source: None }
    }

    /// A token observing the shared, already-cancelled source.
    pub fn cancelled() -> Self {
        CancellationTokenSource::always_cancelled().token()
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.source
            .as_ref()
            .is_some_and(|s| s.is_cancellation_requested())
    }

    /// Returns `false` if this token can never observe a cancellation.
    pub fn can_be_cancelled(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.can_be_cancelled())
    }

    /// Returns `true` if both tokens observe the same source.
    pub fn same_source(&self, other: &CancellationToken) -> bool {
        match (&self.source, &other.source) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("can_be_cancelled", &self.can_be_cancelled())
            .field("cancelled", &self.is_cancellation_requested())
            .finish()
    }
}
