//! Length-prefixed binary encoding shared by every job type.
//!
//! All multi-byte integers are little-endian. Strings are UTF-8, prefixed by
//! their byte length written with [`WireWriter::write_length`], a 7-bit
//! variable-width count (so empty strings and empty collections cost one
//! byte). Collections are a length followed by their elements.

mod codec;

pub use codec::{WireReader, WireWriter};
