//! Per-call state carried across the four phases of an intercepted API call.
//!
//! Every intercepted call goes through [`run_call`], which runs the phases of
//! its [`Hooks`] in order ([`Phase::Validate`], [`Phase::Record`],
//! [`Phase::Dispatch`], [`Phase::PostRecord`]), passing them a fresh [`Call`]
//! that's dropped once the call ends (so nothing can outlive it).
//!
//! Each field of the per-call state is a [`Slot`], written by exactly one
//! phase (its "producer") and only readable by later phases.

/// The phases of one intercepted call, in execution order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Read-only checks of the call's preconditions (may reject the call).
    Validate,

    /// Building instrumentation artifacts (may decide to skip instrumentation).
    Record,

    /// Forwarding the call to the next layer/driver.
    Dispatch,

    /// Persisting the call's results into long-lived tracking state.
    PostRecord,
}

/// A field of per-call state, with the phase allowed to produce it.
#[derive(Debug)]
pub struct Slot<T> {
    producer: Phase,
    value: Option<T>,
}

impl<T> Slot<T> {
    pub const fn new(producer: Phase) -> Self {
        Self { producer, value: None }
    }

    pub fn producer(&self) -> Phase {
        self.producer
    }
}

/// The state of one call in progress (only ever used for that one call).
pub struct Call<S> {
    phase: Phase,
    skip: bool,
    state: S,
}

impl<S> Call<S> {
    fn new(state: S) -> Self {
        Self { phase: Phase::Validate, skip: false, state }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether instrumentation is skipped for this call (which is then
    /// forwarded unchanged, if at all).
    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    /// Give up on instrumenting this call: the original call is forwarded,
    /// and nothing produced by [`Phase::Dispatch`] reaches [`Phase::PostRecord`].
    pub fn skip(&mut self) {
        debug_assert!(
            matches!(self.phase, Phase::Record | Phase::Dispatch),
            "`skip` called during {:?}",
            self.phase
        );
        self.skip = true;
    }

    /// Produce the value of `slot` (only allowed in its producing phase).
    pub fn put<T>(&mut self, slot: impl FnOnce(&mut S) -> &mut Slot<T>, value: T) {
        let (phase, skip) = (self.phase, self.skip);
        let slot = slot(&mut self.state);
        let producer = slot.producer;
        debug_assert_eq!(phase, producer, "slot produced by {producer:?} put during {phase:?}");
        if phase != producer || (skip && producer == Phase::Dispatch) {
            return;
        }
        slot.value = Some(value);
    }

    /// Read `slot`, which must have been produced by an earlier phase.
    pub fn get<T>(&self, slot: impl FnOnce(&S) -> &Slot<T>) -> Option<&T> {
        let slot = slot(&self.state);
        if !self.is_readable(slot.producer) {
            return None;
        }
        slot.value.as_ref()
    }

    /// Move the value out of `slot` (see [`Call::get`]).
    pub fn take<T>(&mut self, slot: impl FnOnce(&mut S) -> &mut Slot<T>) -> Option<T> {
        let (phase, skip) = (self.phase, self.skip);
        let slot = slot(&mut self.state);
        if !Self::readable_from(phase, skip, slot.producer) {
            return None;
        }
        slot.value.take()
    }

    fn is_readable(&self, producer: Phase) -> bool {
        Self::readable_from(self.phase, self.skip, producer)
    }

    fn readable_from(phase: Phase, skip: bool, producer: Phase) -> bool {
        debug_assert!(producer < phase, "slot produced by {producer:?} read during {phase:?}");
        producer < phase && !(skip && producer == Phase::Dispatch)
    }
}

/// The phases of one kind of intercepted call.
pub trait Hooks {
    /// Per-call state (a struct of [`Slot`]s).
    type State: Default;

    /// Result of forwarding the call.
    type Output;

    /// Check the call's preconditions, returning `false` to reject it (in
    /// which case it's neither recorded nor forwarded).
    fn validate(&mut self, call: &Call<Self::State>) -> bool {
        let _ = call;
        true
    }

    fn record(&mut self, call: &mut Call<Self::State>);

    /// Forward the call (the original one, if [`Call::is_skipped`]).
    fn dispatch(&mut self, call: &mut Call<Self::State>) -> Self::Output;

    fn post_record(&mut self, call: &mut Call<Self::State>);
}

/// Run one call through all of its phases, returning `None` if it was rejected
/// during [`Phase::Validate`].
pub fn run_call<H: Hooks>(hooks: &mut H) -> Option<H::Output> {
    let mut call = Call::new(H::State::default());

    if !hooks.validate(&call) {
        return None;
    }

    call.phase = Phase::Record;
    hooks.record(&mut call);

    call.phase = Phase::Dispatch;
    let output = hooks.dispatch(&mut call);

    call.phase = Phase::PostRecord;
    hooks.post_record(&mut call);

    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct State {
        recorded: Slot<u32>,
        dispatched: Slot<&'static str>,
    }

    impl Default for State {
        fn default() -> Self {
            Self { recorded: Slot::new(Phase::Record), dispatched: Slot::new(Phase::Dispatch) }
        }
    }

    #[derive(Default)]
    struct Recorder {
        skip_in_record: bool,
        reject: bool,
        dispatch_saw_skip: Option<bool>,
        post_saw: Option<(Option<u32>, Option<&'static str>)>,
    }

    impl Hooks for Recorder {
        type State = State;
        type Output = &'static str;

        fn validate(&mut self, _: &Call<State>) -> bool {
            !self.reject
        }

        fn record(&mut self, call: &mut Call<State>) {
            call.put(|s| &mut s.recorded, 42);
            if self.skip_in_record {
                call.skip();
            }
        }

        fn dispatch(&mut self, call: &mut Call<State>) -> &'static str {
            self.dispatch_saw_skip = Some(call.is_skipped());
            assert_eq!(call.get(|s| &s.recorded), Some(&42));
            call.put(|s| &mut s.dispatched, "instrumented");
            if call.is_skipped() {
                "original"
            } else {
                "instrumented"
            }
        }

        fn post_record(&mut self, call: &mut Call<State>) {
            let recorded = call.get(|s| &s.recorded).copied();
            self.post_saw = Some((recorded, call.take(|s| &mut s.dispatched)));
        }
    }

    #[test]
    fn phases_see_earlier_slots() {
        let mut hooks = Recorder::default();
        assert_eq!(run_call(&mut hooks), Some("instrumented"));
        assert_eq!(hooks.dispatch_saw_skip, Some(false));
        assert_eq!(hooks.post_saw, Some((Some(42), Some("instrumented"))));
    }

    #[test]
    fn skipped_calls_persist_nothing_from_dispatch() {
        let mut hooks = Recorder { skip_in_record: true, ..Default::default() };
        assert_eq!(run_call(&mut hooks), Some("original"));
        assert_eq!(hooks.dispatch_saw_skip, Some(true));
        assert_eq!(hooks.post_saw, Some((Some(42), None)));
    }

    #[test]
    fn rejected_calls_stop_after_validation() {
        let mut hooks = Recorder { reject: true, ..Default::default() };
        assert_eq!(run_call(&mut hooks), None);
        assert_eq!(hooks.dispatch_saw_skip, None);
        assert_eq!(hooks.post_saw, None);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic = "read during Record"]
    fn reading_before_production_is_a_bug() {
        let mut call = Call::new(State::default());
        call.phase = Phase::Record;
        let _ = call.get(|s| &s.dispatched);
    }
}
