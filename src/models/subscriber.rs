use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::target::{Scope, TargetId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "kind", content = "targets")]
pub enum Follows {
    All,
    Targets(BTreeSet<TargetId>),
}

/// A chat recipient and the targets they want alerts for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscriber {
    pub recipient: String,
    pub name: Option<String>,
    pub follows: Follows,
    /// Forum topic to post into when the recipient is a group chat.
    pub thread_id: Option<i64>,
}

impl Subscriber {
    pub fn new(recipient: impl Into<String>, name: Option<String>, scope: &Scope) -> Self {
        let follows = match scope {
            Scope::All => Follows::All,
            Scope::Target(id) => Follows::Targets(BTreeSet::from([id.clone()])),
        };
        Self {
            recipient: recipient.into(),
            name,
            follows,
            thread_id: None,
        }
    }

    pub fn is_interested(&self, target: &TargetId) -> bool {
        match &self.follows {
            Follows::All => true,
            Follows::Targets(targets) => targets.contains(target),
        }
    }

    pub fn follow(&mut self, scope: &Scope) {
        match (scope, &mut self.follows) {
            (Scope::All, follows) => *follows = Follows::All,
            (Scope::Target(_), Follows::All) => {}
            (Scope::Target(id), Follows::Targets(targets)) => {
                targets.insert(id.clone());
            }
        }
    }

    /// Stops following a single target. Returns false when nothing changed.
    pub fn unfollow(&mut self, target: &TargetId) -> bool {
        match &mut self.follows {
            Follows::All => false,
            Follows::Targets(targets) => targets.remove(target),
        }
    }

    pub fn follows_nothing(&self) -> bool {
        matches!(&self.follows, Follows::Targets(targets) if targets.is_empty())
    }
}
