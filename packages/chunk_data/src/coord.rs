//! World positions and the partition of the plane into chunks.

use std::{
    fmt,
    str::FromStr,
};
use serde::{Serialize, Deserialize};
use vek::*;


/// Side length of the square cell each chunk covers, in world units.
pub const CHUNK_SIZE: f64 = 400.0;

/// How many chunks out from its own chunk an object keeps loaded and subscribed.
pub const NEIGHBORHOOD_RADIUS: i64 = 1;


/// Position of an object in the world plane.
pub type Position = Vec2<f64>;


/// Identifier of a chunk: its cell coordinate.
///
/// Crosses the wire and the save file as the string `"x,y"`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChunkId {
    pub x: i64,
    pub y: i64,
}

impl ChunkId {
    /// Construct from components.
    pub fn new(x: i64, y: i64) -> Self {
        ChunkId { x, y }
    }
}

/// The chunk a position is located in.
///
/// Total: positions with a non-finite coordinate land in chunk `0,0`.
pub fn chunk_id_of(pos: Position) -> ChunkId {
    fn cell(coord: f64) -> i64 {
        if coord.is_finite() {
            // saturating float to int cast
            (coord / CHUNK_SIZE).floor() as i64
        } else {
            0
        }
    }

    ChunkId::new(cell(pos.x), cell(pos.y))
}

/// The chunks which must be loaded and subscribed for an object located in `chunk_id`.
///
/// Row-major order, always includes `chunk_id` itself.
pub fn neighborhood_of(chunk_id: ChunkId) -> Vec<ChunkId> {
    let r = NEIGHBORHOOD_RADIUS;
    let mut chunk_ids = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
    for dy in -r..=r {
        for dx in -r..=r {
            chunk_ids.push(ChunkId::new(
                chunk_id.x.saturating_add(dx),
                chunk_id.y.saturating_add(dy),
            ));
        }
    }
    chunk_ids
}


/// Error parsing a `ChunkId` from its `"x,y"` form.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ParseChunkIdError(String);

impl fmt::Display for ParseChunkIdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid chunk id {:?}", self.0)
    }
}

impl std::error::Error for ParseChunkIdError {}

impl FromStr for ChunkId {
    type Err = ParseChunkIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseChunkIdError(s.to_owned());
        let (x, y) = s.split_once(',').ok_or_else(err)?;
        Ok(ChunkId::new(
            x.trim().parse().map_err(|_| err())?,
            y.trim().parse().map_err(|_| err())?,
        ))
    }
}

impl From<ChunkId> for String {
    fn from(chunk_id: ChunkId) -> String {
        chunk_id.to_string()
    }
}

impl TryFrom<String> for ChunkId {
    type Error = ParseChunkIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}


macro_rules! impl_fmt_chunk_id {
    ($t:ident, $fstr:literal)=>{
        impl fmt::$t for ChunkId {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(
                    f, $fstr,
                    self.x, self.y,
                )
            }
        }
    };
}
impl_fmt_chunk_id!(Debug, "<{},{}>");
impl_fmt_chunk_id!(Display, "{},{}");


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_of_floors_toward_negative_infinity() {
        assert_eq!(chunk_id_of(Vec2::new(0.0, 0.0)), ChunkId::new(0, 0));
        assert_eq!(chunk_id_of(Vec2::new(399.99, 0.0)), ChunkId::new(0, 0));
        assert_eq!(chunk_id_of(Vec2::new(400.0, 0.0)), ChunkId::new(1, 0));
        assert_eq!(chunk_id_of(Vec2::new(-0.5, -400.0)), ChunkId::new(-1, -1));
        assert_eq!(chunk_id_of(Vec2::new(-400.5, 799.0)), ChunkId::new(-2, 1));
    }

    #[test]
    fn chunk_id_of_is_total() {
        assert_eq!(chunk_id_of(Vec2::new(f64::NAN, 10.0)), ChunkId::new(0, 0));
        assert_eq!(chunk_id_of(Vec2::new(f64::INFINITY, f64::NEG_INFINITY)), ChunkId::new(0, 0));
        let far = chunk_id_of(Vec2::new(1e300, -1e300));
        assert_eq!(far, ChunkId::new(i64::MAX, i64::MIN));
    }

    #[test]
    fn neighborhood_contains_self_and_is_stable() {
        for x in -3..3 {
            for y in -3..3 {
                let c = ChunkId::new(x, y);
                let hood = neighborhood_of(c);
                assert!(hood.contains(&c));
                assert_eq!(hood.len(), 9);
                assert_eq!(hood, neighborhood_of(c));
            }
        }
        assert_eq!(neighborhood_of(ChunkId::new(5, 5))[0], ChunkId::new(4, 4));
        assert_eq!(neighborhood_of(ChunkId::new(5, 5))[8], ChunkId::new(6, 6));
    }

    #[test]
    fn chunk_id_string_form() {
        assert_eq!(ChunkId::new(1, -2).to_string(), "1,-2");
        assert_eq!("1,-2".parse::<ChunkId>(), Ok(ChunkId::new(1, -2)));
        assert!("1;2".parse::<ChunkId>().is_err());
        assert!("a,2".parse::<ChunkId>().is_err());
        assert_eq!(serde_json::to_string(&ChunkId::new(0, 3)).unwrap(), r#""0,3""#);
        assert_eq!(serde_json::from_str::<ChunkId>(r#""7,8""#).unwrap(), ChunkId::new(7, 8));
    }
}
