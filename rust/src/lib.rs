//! flake: Flake v1 identifier generation and validation.
//!
//! A Flake v1 is a 12-byte, time-sortable, collision-resistant identifier for
//! distributed workers. Byte-wise comparison follows generation order for
//! identifiers produced by the same generator.
//!
//! # Format
//!
//! ```text
//! FLAKE ::= VERSION(4) TIMESTAMP_USEC(52) OVERFLOW(8) WORKER(24) CRC8(8)
//! ```
//!
//! # Example
//!
//! ```
//! use flake::{FlakeGen, validate};
//!
//! let flake_gen = FlakeGen::new(0x00aaaaaa).expect("secure random source available");
//! let id = flake_gen.next_raw();
//! assert!(validate(&id).is_ok());
//! println!("{}", flake_gen.next_hex()); // e.g. "1061d4c2b9a8e07faaaaaa3c"
//! ```

mod crc8;
mod flake;
mod validate;

pub use crc8::checksum;
pub use flake::{
    B64_LEN, FlakeError, FlakeGen, FlakeId, HEX_LEN, ID_LEN, MAX_WORKER_ID, VERSION,
};
pub use validate::{ParsedFlake, parse_flake, validate};
