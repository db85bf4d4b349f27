//! Choosing the assistant persona that answers the next turn

use serde::{Deserialize, Serialize};

/// An assistant configuration the user may talk to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Persona {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
        }
    }
}

/// Inputs to [`select_live_assistant`], highest precedence first
#[derive(Debug, Clone, Default)]
pub struct PersonaChoice<'a> {
    /// Picked by the user for this turn
    pub explicit: Option<i64>,
    /// Persona the session was created with
    pub session_default: Option<i64>,
    /// User's pinned personas, in display order
    pub pinned: &'a [i64],
}

/// Resolve the live assistant: explicit selection, then the session's
/// persona, then the first pinned persona, then the first available one.
///
/// Ids that are not in `available` are skipped. Within a list the earliest
/// entry wins.
pub fn select_live_assistant<'p>(choice: &PersonaChoice<'_>, available: &'p [Persona]) -> Option<&'p Persona> {
    let find = |id: i64| available.iter().find(|persona| persona.id == id);

    choice
        .explicit
        .and_then(find)
        .or_else(|| choice.session_default.and_then(find))
        .or_else(|| choice.pinned.iter().find_map(|id| find(*id)))
        .or_else(|| available.first())
}
