//! Wire protocol: framing and message codecs.
//!
//! Two layers, bottom up:
//!
//! - [`framing`] turns an opaque byte payload into a self-delimiting,
//!   checksummed frame and back.
//! - [`message`] builds and parses the two message shapes (request,
//!   response) carried inside frame payloads.
//!
//! Everything that appears on the wire is defined here; the rest of the
//! crate only moves these bytes around.

pub mod framing;
pub mod message;

pub use framing::{checksum, encode_frame, read_frame, write_frame, DecodedFrame};
pub use message::{build_request, build_response, parse_request, parse_response, Status};

/// Protocol version exchanged during the HOLA handshake.
///
/// A mismatch is logged by both ends; neither refuses to proceed.
pub const VERSION: &[u8] = b"1";

/// Separator between method name and content in a request payload.
pub const NULL: u8 = 0x00;

/// Reserved method names, dispatched by the system callback table
/// before any user handler is consulted.
pub mod methods {
    /// Handshake; payload is the sender's protocol version.
    pub const HOLA: &[u8] = b"HOLA";
    /// Login; payload is the UTF-8 client name.
    pub const LOGIN: &[u8] = b"LOGIN";
    /// Register this connection as a push target; payload is the UTF-8
    /// client name.
    pub const CALLBACK: &[u8] = b"CALLBACK";
    /// Teardown; empty payload.
    pub const CHAU: &[u8] = b"CHAU";
}
