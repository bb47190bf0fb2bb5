//! Per-(room, connection) dispatch state.
//!
//! A connection is either outside a room or inside it. Everything other than `join`,
//! `ping` and a room-less `leave` needs the connection to be inside the room it names.

use crate::error::CollabError;
use crate::protocol::ClientAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participation {
    Unjoined,
    Joined,
}

impl Participation {
    /// Check that `action` is allowed from this state and return the state it leads to.
    pub fn transition(self, action: &ClientAction) -> Result<Participation, CollabError> {
        use Participation::*;

        match (self, action) {
            (_, ClientAction::Join { .. }) => Ok(Joined),
            (_, ClientAction::Ping) => Ok(self),
            (_, ClientAction::Leave { room: None }) => Ok(Unjoined),
            (Joined, ClientAction::Leave { room: Some(_) }) => Ok(Unjoined),
            (
                Joined,
                ClientAction::Focus { .. }
                | ClientAction::Update { .. }
                | ClientAction::UpdateAll { .. }
                | ClientAction::Discard { .. },
            ) => Ok(Joined),
            (Unjoined, action) => Err(CollabError::Validation(format!(
                "{} requires joining room {} first",
                action.name(),
                action.room().unwrap_or_default()
            ))),
        }
    }
}
