//! Game objects, the things that live in chunks.

use crate::coord::*;
use std::fmt;
use serde::{Serialize, Deserialize};


/// Stable identifier of a game object, assigned by storage.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}


/// Kind of game object.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Player,
    Npc,
    Prop,
}


/// A game object as held live by the chunk it's located in.
#[derive(Debug, Clone, PartialEq)]
pub struct GameObject {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub position: Position,
    /// Chunk the object belongs to. Equal to `chunk_id_of(position)` once a tick has settled.
    pub chunk_id: ChunkId,
    /// For player objects, the username that owns it.
    pub player_name: Option<String>,
    pub chat_message: Option<String>,
}

impl GameObject {
    /// Format for sending to clients.
    pub fn format(&self) -> FormattedObject {
        FormattedObject {
            id: self.id,
            kind: self.kind,
            position: self.position,
        }
    }
}


/// The shape in which a game object crosses the wire. Internal-only fields never do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedObject {
    pub id: ObjectId,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub position: Position,
}


#[cfg(test)]
mod tests {
    use super::*;
    use vek::*;

    #[test]
    fn formatted_object_wire_shape() {
        let obj = GameObject {
            id: ObjectId(4),
            kind: ObjectKind::Npc,
            position: Vec2::new(1.5, -2.0),
            chunk_id: ChunkId::new(0, -1),
            player_name: None,
            chat_message: Some("oink".into()),
        };
        let json = serde_json::to_value(obj.format()).unwrap();
        assert_eq!(json, serde_json::json!({
            "id": 4,
            "type": "npc",
            "position": { "x": 1.5, "y": -2.0 },
        }));
    }
}
