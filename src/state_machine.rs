// Copyright 2018-2022 Cargill Incorporated
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A small labeled-state graph with multi-hop traversal. Unlike a state-machine-library mixin
//! injected into a device class, `StateMachine` is a plain field a `Device` owns and delegates to
//! (see the composition-over-mixin note on device design).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::DeviceError;

pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
pub const CONNECTED: &str = "CONNECTED";

/// One transition action: runs arbitrary device logic (commonly a command via the `Runner`) as
/// the machine moves from `src` to `dst`. Failure aborts the traversal.
pub type Action = Box<dyn Fn(&str, &str) -> Result<(), DeviceError> + Send + Sync>;

#[derive(Default)]
struct Transition {
    actions: Vec<Action>,
}

struct Graph {
    current: String,
    transitions: HashMap<(String, String), Transition>,
    hops: HashMap<(String, String), String>,
    state_prompts: HashMap<String, String>,
}

/// Labeled states, direct transitions with ordered actions, and hop routes for multi-step
/// traversal. All mutation happens under one mutex so `goto_state` calls serialize and
/// `current_state` reads never observe a half-applied transition.
pub struct StateMachine {
    graph: Mutex<Graph>,
}

impl StateMachine {
    pub fn new(initial_state: impl Into<String>) -> Self {
        StateMachine {
            graph: Mutex::new(Graph {
                current: initial_state.into(),
                transitions: HashMap::new(),
                hops: HashMap::new(),
                state_prompts: HashMap::new(),
            }),
        }
    }

    pub fn current_state(&self) -> String {
        mutex_lock_unwrap!(self.graph).current.clone()
    }

    pub fn set_state_prompt(&self, state: impl Into<String>, prompt: impl Into<String>) {
        mutex_lock_unwrap!(self.graph)
            .state_prompts
            .insert(state.into(), prompt.into());
    }

    pub fn state_prompt(&self, state: &str) -> Option<String> {
        mutex_lock_unwrap!(self.graph).state_prompts.get(state).cloned()
    }

    /// Registers the ordered action list run when transitioning directly from `src` to `dst`.
    /// Overwrites any actions previously registered for the same pair.
    pub fn add_transition(&self, src: impl Into<String>, dst: impl Into<String>, actions: Vec<Action>) {
        mutex_lock_unwrap!(self.graph)
            .transitions
            .insert((src.into(), dst.into()), Transition { actions });
    }

    /// Registers an intermediate hop: reaching `dst` from `src` first requires passing through
    /// `via`. `(src, via)` and `(via, dst)` must each have a direct transition registered, or
    /// `goto_state` through this hop fails.
    pub fn add_hop(&self, src: impl Into<String>, dst: impl Into<String>, via: impl Into<String>) {
        mutex_lock_unwrap!(self.graph)
            .hops
            .insert((src.into(), dst.into()), via.into());
    }

    /// Forces `current` without running any transition actions. Used by `Device` to reflect
    /// `connection_made`/`connection_lost` notifications, which are not actions of this graph.
    pub fn force_state(&self, state: impl Into<String>) {
        mutex_lock_unwrap!(self.graph).current = state.into();
    }

    /// Walks from the current state to `dst`, one direct transition at a time, resolving hops as
    /// needed. Every action of a step must succeed before the next step begins; a failing action
    /// leaves `current` at the last state that was fully entered.
    pub fn goto_state(&self, dst: &str) -> Result<(), DeviceError> {
        let mut graph = mutex_lock_unwrap!(self.graph);
        if graph.current == dst {
            return Ok(());
        }

        loop {
            let src = graph.current.clone();
            if src == dst {
                return Ok(());
            }

            let step_dst = graph
                .hops
                .get(&(src.clone(), dst.to_string()))
                .cloned()
                .unwrap_or_else(|| dst.to_string());

            let key = (src.clone(), step_dst.clone());
            let action_count = match graph.transitions.get(&key) {
                Some(transition) => transition.actions.len(),
                None => {
                    return Err(DeviceError::DeviceFailure(format!(
                        "no transition registered from '{}' to '{}'; state '{}' is unreachable",
                        src, step_dst, dst
                    )))
                }
            };

            for index in 0..action_count {
                let action_result = {
                    let transition = graph
                        .transitions
                        .get(&key)
                        .expect("transition present for the duration of this loop");
                    (transition.actions[index])(&src, &step_dst)
                };
                if let Err(err) = action_result {
                    return Err(err);
                }
            }

            debug!("state transition '{}' -> '{}'", src, step_dst);
            graph.current = step_dst;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn goto_same_state_is_noop() {
        let sm = StateMachine::new(NOT_CONNECTED);
        sm.goto_state(NOT_CONNECTED).unwrap();
        assert_eq!(sm.current_state(), NOT_CONNECTED);
    }

    #[test]
    fn goto_missing_transition_is_device_failure() {
        let sm = StateMachine::new(NOT_CONNECTED);
        match sm.goto_state(CONNECTED) {
            Err(DeviceError::DeviceFailure(_)) => {}
            other => panic!("expected DeviceFailure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn goto_runs_direct_transition_actions_in_order() {
        let sm = StateMachine::new(NOT_CONNECTED);
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        let second = Arc::clone(&order);
        sm.add_transition(
            NOT_CONNECTED,
            CONNECTED,
            vec![
                Box::new(move |_src, _dst| {
                    first.lock().unwrap().push(1);
                    Ok(())
                }),
                Box::new(move |_src, _dst| {
                    second.lock().unwrap().push(2);
                    Ok(())
                }),
            ],
        );

        sm.goto_state(CONNECTED).unwrap();
        assert_eq!(sm.current_state(), CONNECTED);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn goto_traverses_hop_through_intermediate_state() {
        let sm = StateMachine::new("UNIX_LOCAL");
        let visits = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&visits);
        let b = Arc::clone(&visits);
        sm.add_transition(
            "UNIX_LOCAL",
            "UNIX_REMOTE",
            vec![Box::new(move |_s, _d| {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })],
        );
        sm.add_transition(
            "UNIX_REMOTE",
            "PROXY_PC",
            vec![Box::new(move |_s, _d| {
                b.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })],
        );
        sm.add_hop("UNIX_LOCAL", "PROXY_PC", "UNIX_REMOTE");

        sm.goto_state("PROXY_PC").unwrap();
        assert_eq!(sm.current_state(), "PROXY_PC");
        assert_eq!(visits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_action_aborts_traversal_at_last_stable_state() {
        let sm = StateMachine::new(NOT_CONNECTED);
        sm.add_transition(
            NOT_CONNECTED,
            CONNECTED,
            vec![Box::new(|_src, _dst| {
                Err(DeviceError::DeviceFailure("link down".into()))
            })],
        );

        assert!(sm.goto_state(CONNECTED).is_err());
        assert_eq!(sm.current_state(), NOT_CONNECTED);
    }
}
