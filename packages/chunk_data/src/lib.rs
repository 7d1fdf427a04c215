//! Data shared between the world server and anything speaking its protocol: positions, the
//! partition of the world into chunks, and game objects.
//!
//! ```
//! use chunk_data::*;
//! use vek::*;
//!
//! let home = chunk_id_of(Vec2::new(700.0, 700.0));
//! assert_eq!(home.to_string(), "1,1");
//! assert!(neighborhood_of(home).contains(&home));
//! ```

mod coord;
mod object;


pub use crate::{
    coord::{
        CHUNK_SIZE,
        NEIGHBORHOOD_RADIUS,
        Position,
        ChunkId,
        ParseChunkIdError,
        chunk_id_of,
        neighborhood_of,
    },
    object::{
        ObjectId,
        ObjectKind,
        GameObject,
        FormattedObject,
    },
};
