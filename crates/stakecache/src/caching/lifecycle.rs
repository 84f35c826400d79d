use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("the cache is running")]
    AlreadyRunning,
    #[error("the cache is starting or stopping")]
    Transitioning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    NotRunning = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => State::Starting,
            2 => State::Running,
            3 => State::Stopping,
            _ => State::NotRunning,
        }
    }
}

/// What a caller should do after trying to begin a transition.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    /// The caller owns the transition and has to [`Lifecycle::finish`] it.
    Begin,
    /// The cache already is in the requested state.
    Done,
}

/// The run state of a cache, allowing exactly one start or stop at a time.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(State::NotRunning as u8),
        }
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn begin(&self, from: State, via: State, target: State) -> Result<Transition, LifecycleError> {
        match self.state.compare_exchange(
            from as u8,
            via as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(Transition::Begin),
            Err(current) if current == target as u8 => Ok(Transition::Done),
            Err(_) => Err(LifecycleError::Transitioning),
        }
    }

    pub(crate) fn begin_start(&self) -> Result<Transition, LifecycleError> {
        self.begin(State::NotRunning, State::Starting, State::Running)
    }

    pub(crate) fn begin_stop(&self) -> Result<Transition, LifecycleError> {
        self.begin(State::Running, State::Stopping, State::NotRunning)
    }

    /// Completes the transition begun by the caller.
    pub(crate) fn finish(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.begin_stop(), Ok(Transition::Done));

        assert_eq!(lifecycle.begin_start(), Ok(Transition::Begin));
        assert_eq!(lifecycle.state(), State::Starting);
        assert_eq!(lifecycle.begin_start(), Err(LifecycleError::Transitioning));
        assert_eq!(lifecycle.begin_stop(), Err(LifecycleError::Transitioning));

        lifecycle.finish(State::Running);
        assert_eq!(lifecycle.begin_start(), Ok(Transition::Done));

        assert_eq!(lifecycle.begin_stop(), Ok(Transition::Begin));
        assert_eq!(lifecycle.state(), State::Stopping);
        lifecycle.finish(State::NotRunning);
        assert_eq!(lifecycle.state(), State::NotRunning);
    }
}
