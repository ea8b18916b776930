//! Tag mutation events.

use crate::types::{ScopeId, Tag};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Fired after a tag record has been durably written or removed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TagEvent {
    /// A tag was created.
    Created { tag: Tag },

    /// A tag was updated. `previous` is the state before the write, when the
    /// event source has it; without it a parent change cannot be detected.
    Updated {
        tag: Tag,
        #[serde(default)]
        previous: Option<Tag>,
    },

    /// A tag was deleted. `tag` is its last stored state.
    Deleted { tag: Tag },
}

impl TagEvent {
    /// Event name as used by the mutation source.
    pub fn name(&self) -> &'static str {
        match self {
            TagEvent::Created { .. } => "tag_create",
            TagEvent::Updated { .. } => "tag_update",
            TagEvent::Deleted { .. } => "tag_delete",
        }
    }

    /// The tag the event is about.
    pub fn tag(&self) -> &Tag {
        match self {
            TagEvent::Created { tag } | TagEvent::Updated { tag, .. } | TagEvent::Deleted { tag } => {
                tag
            }
        }
    }

    /// Every scope a listing could have to change for, before and after.
    pub fn scopes(&self) -> BTreeSet<ScopeId> {
        let mut scopes = self.tag().scopes.clone();
        if let TagEvent::Updated {
            previous: Some(previous),
            ..
        } = self
        {
            scopes.extend(previous.scopes.iter().cloned());
        }
        scopes
    }
}
