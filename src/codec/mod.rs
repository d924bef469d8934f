//! Binary encodings and payload compression
//!
//! Everything persisted by the stores goes through this module: fixed-size
//! element layouts for tile payloads, the node/index header binary layout used
//! by the streaming store, and the compression adapter (zstd for generic
//! payloads, JPEG for textures).

mod compress;
mod cursor;
mod element;
pub mod header;
mod texture;

pub use compress::{PayloadCodec, ZstdCodec};
pub(crate) use cursor::{put_id, put_ids, ByteReader};
pub use element::{decode_elements, encode_elements, Element};
pub use texture::{texture_side, JpegCodec};
