//! linkchat protocol core: admission policy, timing profiles, line framing.
//! No sockets here; the daemon owns all I/O.

pub mod admission;
pub mod framing;
pub mod profile;

pub use admission::{AdmissionController, InitError, LinkKind, DEFAULT_COOLDOWN};
pub use framing::{encode_line, LineAssembler, READ_CHUNK_SIZE};
pub use profile::{DeviceTimingProfile, HardwareClass};
