use crate::scheduler::{Action, LaneId, Schedule};
use dashmap::DashMap;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Schedule,
    Run,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Schedule { lane: Option<LaneId> },
    Run { thread: Option<String> },
}

#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        map.insert(Method::Schedule, Vec::new());
        map.insert(Method::Run, Vec::new());

        Self {
            calls: Arc::new(map),
        }
    }

    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls
            .get_mut(&method)
            .expect("method not found")
            .push(call)
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .expect("method not found")
            .value()
            .clone()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }
}

/// Wraps a strategy and records every action handed to it and every action
/// it starts running.
#[derive(Debug)]
pub(crate) struct SpyScheduler<S> {
    inner: S,
    pub(crate) tracker: Tracker,
}

impl<S> SpyScheduler<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            tracker: Tracker::new(),
        }
    }
}

impl<S: Schedule> Schedule for SpyScheduler<S> {
    fn schedule(&self, action: Action) {
        self.tracker.record(
            Method::Schedule,
            Call::Schedule {
                lane: self.inner.lane(),
            },
        );

        let tracker = self.tracker.clone();
        self.inner.schedule(Box::new(move || {
            tracker.record(
                Method::Run,
                Call::Run {
                    thread: thread::current().name().map(str::to_string),
                },
            );
            action();
        }));
    }

    fn lane(&self) -> Option<LaneId> {
        self.inner.lane()
    }
}
