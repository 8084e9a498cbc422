//! A small string-keyed finite-state machine.
//!
//! States hold event → transition maps; transitions may carry a guard
//! predicate and fire enter/leave actions. Events with no mapping in the
//! current state are ignored, which is exactly the lifecycle contract:
//! out-of-state events are no-ops.

use ahash::AHashMap;
use std::sync::Arc;

pub type Action = Arc<dyn Fn() + Send + Sync + 'static>;
pub type Predicate = Arc<dyn Fn() -> bool + Send + Sync + 'static>;

struct Transition {
    target: String,
    predicate: Option<Predicate>,
}

#[derive(Default)]
struct StateNode {
    transitions: AHashMap<String, Transition>,
    enter: Option<Action>,
    leave: Option<Action>,
}

pub struct Fsm {
    states: AHashMap<String, StateNode>,
    current: String,
}

impl Fsm {
    pub fn new(initial: impl Into<String>) -> Self {
        let current = initial.into();
        let mut states = AHashMap::new();
        states.insert(current.clone(), StateNode::default());
        Self { states, current }
    }

    fn node(&mut self, state: &str) -> &mut StateNode {
        self.states.entry(state.to_string()).or_default()
    }

    pub fn add_transition(&mut self, from: &str, event: &str, to: &str) {
        self.node(to);
        self.node(from).transitions.insert(
            event.to_string(),
            Transition {
                target: to.to_string(),
                predicate: None,
            },
        );
    }

    /// Transition taken only when `predicate` holds at event time.
    pub fn add_guarded_transition(&mut self, from: &str, event: &str, to: &str, p: Predicate) {
        self.node(to);
        self.node(from).transitions.insert(
            event.to_string(),
            Transition {
                target: to.to_string(),
                predicate: Some(p),
            },
        );
    }

    pub fn set_enter_action(&mut self, state: &str, action: Action) {
        self.node(state).enter = Some(action);
    }

    pub fn set_leave_action(&mut self, state: &str, action: Action) {
        self.node(state).leave = Some(action);
    }

    pub fn current_state(&self) -> &str {
        &self.current
    }

    /// Force the machine into `state` without firing actions. Used to back
    /// out of a transition whose side effects failed.
    pub fn set_state(&mut self, state: &str) {
        self.current = state.to_string();
    }

    /// Names of transition targets that are not themselves states. A
    /// machine built only through `add_*` methods is always consistent;
    /// this guards hand-assembled tables.
    pub fn check_consistency(&self) -> Vec<String> {
        let mut missing = Vec::new();
        for node in self.states.values() {
            for t in node.transitions.values() {
                if !self.states.contains_key(&t.target) && !missing.contains(&t.target) {
                    missing.push(t.target.clone());
                }
            }
        }
        missing
    }

    /// Process one event. Returns true when a transition was taken.
    pub fn handle_event(&mut self, event: &str) -> bool {
        let Some(node) = self.states.get(&self.current) else {
            return false;
        };
        let Some(transition) = node.transitions.get(event) else {
            return false;
        };

        if let Some(p) = &transition.predicate
            && !p()
        {
            return false;
        }

        let target = transition.target.clone();
        if let Some(leave) = &node.leave {
            leave();
        }

        self.current = target;

        if let Some(enter) = self.states.get(&self.current).and_then(|n| n.enter.as_ref()) {
            enter();
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn lifecycle_fsm() -> Fsm {
        let mut fsm = Fsm::new("Standby");
        fsm.add_transition("Standby", "Initialize", "Ready");
        fsm.add_transition("Ready", "Start", "Running");
        fsm.add_transition("Ready", "Stand_down", "Standby");
        fsm.add_transition("Running", "Stop", "Ready");
        fsm
    }

    #[test]
    fn walks_the_lifecycle() {
        let mut fsm = lifecycle_fsm();
        assert!(fsm.handle_event("Initialize"));
        assert_eq!(fsm.current_state(), "Ready");
        assert!(fsm.handle_event("Start"));
        assert_eq!(fsm.current_state(), "Running");
        assert!(fsm.handle_event("Stop"));
        assert_eq!(fsm.current_state(), "Ready");
        assert!(fsm.handle_event("Stand_down"));
        assert_eq!(fsm.current_state(), "Standby");
    }

    #[test]
    fn out_of_state_events_are_ignored() {
        let mut fsm = lifecycle_fsm();
        assert!(!fsm.handle_event("Start"));
        assert_eq!(fsm.current_state(), "Standby");
        fsm.handle_event("Initialize");
        fsm.handle_event("Start");
        assert!(!fsm.handle_event("Initialize"));
        assert_eq!(fsm.current_state(), "Running");
    }

    #[test]
    fn guard_predicate_blocks_transition() {
        let armed = Arc::new(AtomicBool::new(false));
        let mut fsm = Fsm::new("Off");
        let a = armed.clone();
        fsm.add_guarded_transition("Off", "fire", "On", Arc::new(move || a.load(Ordering::SeqCst)));

        assert!(!fsm.handle_event("fire"));
        armed.store(true, Ordering::SeqCst);
        assert!(fsm.handle_event("fire"));
        assert_eq!(fsm.current_state(), "On");
    }

    #[test]
    fn enter_and_leave_actions_fire_in_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let left_at = Arc::new(AtomicUsize::new(0));
        let entered_at = Arc::new(AtomicUsize::new(0));

        let mut fsm = Fsm::new("A");
        fsm.add_transition("A", "go", "B");
        let (c, l) = (counter.clone(), left_at.clone());
        fsm.set_leave_action(
            "A",
            Arc::new(move || l.store(c.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst)),
        );
        let (c, e) = (counter.clone(), entered_at.clone());
        fsm.set_enter_action(
            "B",
            Arc::new(move || e.store(c.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst)),
        );

        assert!(fsm.handle_event("go"));
        assert_eq!(left_at.load(Ordering::SeqCst), 1);
        assert_eq!(entered_at.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn consistency_check_finds_dangling_targets() {
        let fsm = lifecycle_fsm();
        assert!(fsm.check_consistency().is_empty());

        let mut broken = Fsm::new("A");
        broken.add_transition("A", "go", "B");
        broken.states.get_mut("A").unwrap().transitions.insert(
            "jump".to_string(),
            Transition {
                target: "Nowhere".to_string(),
                predicate: None,
            },
        );
        assert_eq!(broken.check_consistency(), vec!["Nowhere".to_string()]);
    }
}
