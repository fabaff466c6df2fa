//! World position value object shared by many game messages.

use serde::{Deserialize, Serialize};

use crate::wire::{WireReader, WireWriter};
use crate::ProtocolError;

/// Where something is in the world hierarchy.
///
/// Messages that carry a location write all five components, always in
/// this order, so every message that embeds one agrees on the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Location {
    pub world_map: i32,
    pub town_map: i32,
    pub building: i32,
    pub interior_map: i32,
    pub room: i32,
}

impl Location {
    /// Encoded size in bytes.
    pub const WIRE_LEN: usize = 5 * 4;

    pub fn encode(&self, w: &mut WireWriter<'_>) {
        w.put_i32(self.world_map);
        w.put_i32(self.town_map);
        w.put_i32(self.building);
        w.put_i32(self.interior_map);
        w.put_i32(self.room);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            world_map: r.get_i32()?,
            town_map: r.get_i32()?,
            building: r.get_i32()?,
            interior_map: r.get_i32()?,
            room: r.get_i32()?,
        })
    }

    /// `true` when the location is inside a town rather than on the world
    /// map. Negative components mean "not set".
    pub fn is_town(&self) -> bool {
        self.town_map >= 0 && self.building < 0
    }

    /// `true` when the location is inside a building room.
    pub fn is_room(&self) -> bool {
        self.building >= 0 && self.room >= 0
    }
}
