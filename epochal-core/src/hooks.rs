//! Hook protocol for training-loop extensibility.
//!
//! A hook observes the run through a fixed set of lifecycle callbacks and can
//! steer it by requesting a stop. Hooks fire strictly in registration order,
//! once per event occurrence, before the trainer moves past that point.
//!
//! Event order for one epoch:
//!
//! ```text
//! on_epoch_begin
//!   (on_batch_begin ... on_batch_end)*          on_batch_end once per optimizer step
//!   on_validation_begin
//!     (on_validation_batch_begin, on_validation_batch_end)*
//!   on_validation_end
//! on_epoch_end
//! ```
//!
//! bracketed by `on_train_begin` and `on_train_end` (or `on_train_failed`).

use serde_json::Value;

use crate::error::TrainError;
use crate::state::RunState;

/// What a hook sees of the run at a call site.
pub struct HookContext<'a> {
    state: &'a RunState,
    stop: &'a mut bool,
}

impl<'a> HookContext<'a> {
    pub fn new(state: &'a RunState, stop: &'a mut bool) -> Self {
        Self { state, stop }
    }

    pub fn state(&self) -> &RunState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.state.epoch
    }

    pub fn step(&self) -> u64 {
        self.state.step
    }

    pub fn best_loss(&self) -> f64 {
        self.state.best_loss
    }

    pub fn best_losses(&self) -> &[f64] {
        &self.state.best_losses
    }

    /// Ask the trainer to finish the current optimizer step, validate and stop.
    pub fn request_stop(&mut self) {
        *self.stop = true;
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop
    }

    /// Direct access to the shared stop flag.
    pub fn stop_flag(&mut self) -> &mut bool {
        self.stop
    }
}

/// A lifecycle observer. Every callback defaults to a no-op.
///
/// `B` is the batch type and `O` the model output type of the run. An error
/// returned from any callback other than [`Hook::on_train_failed`] aborts
/// training.
#[allow(unused_variables)]
pub trait Hook<B, O> {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    fn on_train_begin(&mut self, ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
        Ok(())
    }

    fn on_epoch_begin(&mut self, ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
        Ok(())
    }

    fn on_batch_begin(&mut self, ctx: &mut HookContext<'_>, batch: &B) -> Result<(), TrainError> {
        Ok(())
    }

    /// Called after each optimizer step with the summed window loss.
    fn on_batch_end(
        &mut self,
        ctx: &mut HookContext<'_>,
        batch: &B,
        output: &O,
        loss: f64,
    ) -> Result<(), TrainError> {
        Ok(())
    }

    fn on_validation_begin(&mut self, ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
        Ok(())
    }

    fn on_validation_batch_begin(&mut self, ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
        Ok(())
    }

    fn on_validation_batch_end(
        &mut self,
        ctx: &mut HookContext<'_>,
        batch: &B,
        output: &O,
    ) -> Result<(), TrainError> {
        Ok(())
    }

    fn on_validation_end(&mut self, ctx: &mut HookContext<'_>, loss: f64) -> Result<(), TrainError> {
        Ok(())
    }

    fn on_epoch_end(&mut self, ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
        Ok(())
    }

    fn on_train_end(&mut self, ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
        Ok(())
    }

    /// Best-effort notification; errors returned here are logged and dropped.
    fn on_train_failed(&mut self, ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
        Ok(())
    }

    /// Serializable state stored with each checkpoint.
    fn state(&self) -> Result<Value, TrainError> {
        Ok(Value::Null)
    }

    fn load_state(&mut self, state: Value) -> Result<(), TrainError> {
        Ok(())
    }
}

/// Ordered hooks plus the shared stop flag they can raise.
pub struct HookRegistry<B, O> {
    hooks: Vec<Box<dyn Hook<B, O>>>,
    stop: bool,
}

impl<B, O> HookRegistry<B, O> {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            stop: false,
        }
    }

    pub fn from_hooks(hooks: Vec<Box<dyn Hook<B, O>>>) -> Self {
        Self { hooks, stop: false }
    }

    pub fn register(&mut self, hook: Box<dyn Hook<B, O>>) {
        self.hooks.push(hook);
    }

    pub fn count(&self) -> usize {
        self.hooks.len()
    }

    /// Hook names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop
    }

    pub fn request_stop(&mut self) {
        self.stop = true;
    }

    pub fn clear_stop(&mut self) {
        self.stop = false;
    }

    /// Invoke `event` on every hook in registration order.
    ///
    /// The first error aborts the dispatch; later hooks do not see the event.
    pub fn dispatch<F>(&mut self, state: &RunState, mut event: F) -> Result<(), TrainError>
    where
        F: FnMut(&mut dyn Hook<B, O>, &mut HookContext<'_>) -> Result<(), TrainError>,
    {
        let mut ctx = HookContext::new(state, &mut self.stop);
        for hook in self.hooks.iter_mut() {
            event(hook.as_mut(), &mut ctx)?;
        }
        Ok(())
    }

    /// Tell every hook the run failed. Errors are logged, never propagated.
    pub fn notify_failed(&mut self, state: &RunState) {
        let mut ctx = HookContext::new(state, &mut self.stop);
        for hook in self.hooks.iter_mut() {
            if let Err(e) = hook.on_train_failed(&mut ctx) {
                tracing::warn!(
                    hook = hook.name(),
                    error = %e,
                    "Hook failed while handling training failure"
                );
            }
        }
    }

    /// Collect every hook's state, in registration order.
    pub fn states(&self) -> Result<Vec<Value>, TrainError> {
        self.hooks.iter().map(|h| h.state()).collect()
    }

    /// Route checkpointed states back to their hooks by position.
    pub fn load_states(&mut self, states: &[Value]) -> Result<(), TrainError> {
        if states.len() != self.hooks.len() {
            tracing::warn!(
                stored = states.len(),
                registered = self.hooks.len(),
                "Hook state count differs from registered hooks; restoring by position"
            );
        }
        for (hook, state) in self.hooks.iter_mut().zip(states) {
            hook.load_state(state.clone())?;
        }
        Ok(())
    }
}

impl<B, O> Default for HookRegistry<B, O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: String,
        log: Log,
        stop_on_epoch: Option<u64>,
        seen: u64,
    }

    impl Recorder {
        fn boxed(name: &str, log: &Log) -> Box<dyn Hook<(), ()>> {
            Box::new(Self {
                name: name.into(),
                log: Arc::clone(log),
                stop_on_epoch: None,
                seen: 0,
            })
        }
    }

    impl Hook<(), ()> for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_epoch_begin(&mut self, ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
            self.seen += 1;
            self.log.lock().unwrap().push(format!("{}:{}", self.name, ctx.epoch()));
            if self.stop_on_epoch == Some(ctx.epoch()) {
                ctx.request_stop();
            }
            Ok(())
        }

        fn on_train_failed(&mut self, _ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
            self.log.lock().unwrap().push(format!("failed:{}", self.name));
            Err(TrainError::hook(&self.name, "cleanup broke"))
        }

        fn state(&self) -> Result<Value, TrainError> {
            Ok(json!({ "seen": self.seen }))
        }

        fn load_state(&mut self, state: Value) -> Result<(), TrainError> {
            self.seen = state["seen"].as_u64().unwrap_or(0);
            Ok(())
        }
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let log: Log = Arc::default();
        let mut registry = HookRegistry::new();
        registry.register(Recorder::boxed("a", &log));
        registry.register(Recorder::boxed("b", &log));
        registry.register(Recorder::boxed("c", &log));

        let state = RunState {
            epoch: 4,
            ..RunState::default()
        };
        registry
            .dispatch(&state, |hook, ctx| hook.on_epoch_begin(ctx))
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a:4", "b:4", "c:4"]);
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stop_flag_visible_to_later_hooks() {
        let log: Log = Arc::default();
        let mut registry: HookRegistry<(), ()> = HookRegistry::new();
        registry.register(Box::new(Recorder {
            name: "stopper".into(),
            log: Arc::clone(&log),
            stop_on_epoch: Some(1),
            seen: 0,
        }));

        let state = RunState {
            epoch: 1,
            ..RunState::default()
        };
        assert!(!registry.stop_requested());
        registry
            .dispatch(&state, |hook, ctx| hook.on_epoch_begin(ctx))
            .unwrap();
        assert!(registry.stop_requested());

        registry.clear_stop();
        assert!(!registry.stop_requested());
    }

    #[test]
    fn test_notify_failed_swallows_errors() {
        let log: Log = Arc::default();
        let mut registry = HookRegistry::new();
        registry.register(Recorder::boxed("a", &log));
        registry.register(Recorder::boxed("b", &log));

        registry.notify_failed(&RunState::default());
        assert_eq!(*log.lock().unwrap(), vec!["failed:a", "failed:b"]);
    }

    #[test]
    fn test_states_roundtrip_by_position() {
        let log: Log = Arc::default();
        let mut registry = HookRegistry::new();
        registry.register(Recorder::boxed("a", &log));
        registry.register(Recorder::boxed("b", &log));

        registry
            .load_states(&[json!({"seen": 3}), json!({"seen": 5})])
            .unwrap();
        assert_eq!(
            registry.states().unwrap(),
            vec![json!({"seen": 3}), json!({"seen": 5})]
        );
    }
}
