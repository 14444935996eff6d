//! État transitoire d'une session : anti-écho (déduplication des messages)
//! et suivi des mentions en attente. Vidé à chaque reconnexion et à la déconnexion.

use crate::scheduler::TimerRegistry;
use crate::state::{new_state, Shared};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::debug;

const MENTION_PREFIX: &str = "session:mention:";

pub struct SessionCache {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
    mentions: Shared<HashSet<String>>,
    mention_timeout: Duration,
    timers: TimerRegistry,
}

impl SessionCache {
    pub fn new(timers: TimerRegistry, capacity: usize, mention_timeout: Duration) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            mentions: new_state(HashSet::new()),
            mention_timeout,
            timers,
        }
    }

    /// Vrai si le message a déjà été vu dans cette session (écho)
    pub fn is_duplicate(&mut self, message_id: &str) -> bool {
        if self.seen.contains(message_id) {
            return true;
        }
        self.seen.insert(message_id.to_string());
        self.order.push_back(message_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        false
    }

    /// Démarre (ou relance) l'attente d'une réponse à une mention
    pub fn track_mention(&mut self, user: &str) -> bool {
        self.mentions.lock().insert(user.to_string());
        let mentions = self.mentions.clone();
        let who = user.to_string();
        let scheduled = self.timers.schedule_once(format!("{MENTION_PREFIX}{user}"), self.mention_timeout, move || {
            if mentions.lock().remove(&who) {
                debug!("[session] mention timeout for {who}");
            }
        });
        if !scheduled {
            self.mentions.lock().remove(user);
        }
        scheduled
    }

    pub fn resolve_mention(&mut self, user: &str) -> bool {
        self.timers.cancel(&format!("{MENTION_PREFIX}{user}"));
        self.mentions.lock().remove(user)
    }

    pub fn pending_mentions(&self) -> Vec<String> {
        let mut users: Vec<String> = self.mentions.lock().iter().cloned().collect();
        users.sort();
        users
    }

    pub fn clear(&mut self) {
        let cancelled = self.timers.cancel_prefix("session:");
        self.seen.clear();
        self.order.clear();
        self.mentions.lock().clear();
        if cancelled > 0 {
            debug!("[session] cleared, {cancelled} pending timers cancelled");
        }
    }
}
