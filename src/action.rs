//! Registry of user actions invoked by one-shot timers.
//!
//! Timers only carry a [`CallbackToken`]. The action behind a token lives
//! here and is never serialized; a restored timer finds its action again by
//! looking up the same token.
//!
//! Actions bound by `after_func` are owned by their single timer and are
//! released once that timer fires or stops.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::timer::CallbackToken;

/// A user action bound to a callback token.
pub type Action = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub(crate) struct ActionRegistry {
    actions: HashMap<CallbackToken, Action>,
    owned: HashSet<CallbackToken>,
    /// Unbound owned actions not yet handed to the caller. They are dropped
    /// outside the controller lock, since an action may hold a timer handle.
    released: Vec<Action>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens: Vec<&str> = self.actions.keys().map(CallbackToken::as_str).collect();
        tokens.sort_unstable();
        f.debug_struct("ActionRegistry")
            .field("tokens", &tokens)
            .field("owned", &self.owned.len())
            .field("released", &self.released.len())
            .finish()
    }
}

impl ActionRegistry {
    /// Binds `action` to `token`. Returns true if a previous binding was replaced.
    pub fn register(&mut self, token: CallbackToken, action: Action) -> bool {
        self.owned.remove(&token);
        self.actions.insert(token, action).is_some()
    }

    /// Binds an action that belongs to one timer and goes away with it.
    pub fn register_owned(&mut self, token: CallbackToken, action: Action) {
        self.owned.insert(token.clone());
        self.actions.insert(token, action);
    }

    /// Keeps the action behind `token` alive regardless of timers finishing.
    pub fn disown(&mut self, token: &CallbackToken) {
        self.owned.remove(token);
    }

    /// Unbinds the action behind `token` if a single timer owned it.
    /// Caller-registered bindings stay.
    pub fn release(&mut self, token: &CallbackToken) -> bool {
        if !self.owned.remove(token) {
            return false;
        }
        match self.actions.remove(token) {
            Some(action) => {
                self.released.push(action);
                true
            }
            None => false,
        }
    }

    /// Hands over the actions released since the last call.
    pub fn take_released(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.released)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn contains(&self, token: &CallbackToken) -> bool {
        self.actions.contains_key(token)
    }

    pub fn get(&self, token: &CallbackToken) -> Option<Action> {
        self.actions.get(token).cloned()
    }
}
