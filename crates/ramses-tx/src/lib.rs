//! RAMSES-II packet transport
//!
//! This crate turns the text lines reported by a RAMSES-II gateway (evofw3 or
//! HGI80) into typed messages, and turns command requests back into frames,
//! scheduling them onto the half-duplex RF link with retries.
//!
//! # Architecture
//!
//! The transport operates in four layers:
//!
//! 1. **Interface** - serial connection to the gateway, one line per frame
//! 2. **Framing** - line → [`Packet`] (verb, sequence, addresses, code, payload)
//! 3. **Payload codecs** - [`Packet`] → [`Message`] via the codec [`Registry`],
//!    with multi-packet payloads collected by the [`FragmentBuffer`]
//! 4. **Command engine** - [`Command`] → frame, correlated with its echo and
//!    response, retried on timeout
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ramses_tx::{MessageDecoder, RamsesConfig, Registry};
//! use std::sync::Arc;
//!
//! let config = RamsesConfig::default();
//! let mut decoder = MessageDecoder::new(Arc::new(Registry::new()), &config.fragments);
//!
//! let line = "2024-01-01T12:00:00.000000 045  I --- 04:056053 --:------ 01:145038 30C9 003 0007C1";
//! for decoded in decoder.decode_line(line, chrono::Utc::now().naive_utc())? {
//!     println!("{decoded:?}");
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port interface (requires `libudev-dev` on Linux)
//!
//! # Wire format
//!
//! ```text
//! 2024-01-01T12:00:00.000000 045  I --- 04:056053 --:------ 01:145038 30C9 003 0007C1
//! <timestamp>                rssi verb seqn addr0   addr1     addr2     code len payload
//! ```
//!
//! Frames written to the gateway omit the timestamp and signal strength.

pub mod address;
pub mod codec;
pub mod command;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fragment;
pub mod helpers;
pub mod interface;
pub mod message;
pub mod packet;
pub mod protocol;

pub mod test_utils;

pub use address::{Address, DeviceClass, NULL_ADDR};
pub use codec::{Decoded, DecodeContext, FragmentPart, Payload, PayloadCodec, Registry};
pub use command::{correlate, Command, CommandClass, Correlation, Priority};
pub use config::{FragmentConfig, InterfaceConfig, RamsesConfig, TimeoutConfig, TransportConfig};
pub use dedup::{DuplicateFilter, FilterStats};
pub use error::{CodecError, FramingError, RamsesError, Result};
pub use fragment::{FragmentBuffer, FragmentKey, FragmentStatus};
pub use helpers::HexByte;
pub use interface::{ConnectionState, LineBuffer, RamsesInterface};
pub use message::{AssemblyInfo, Decoding, FragmentInfo, Message, MessageDecoder};
pub use packet::{parse_line, Code, Packet, Verb};
pub use protocol::{CommandEngine, CommandId, CommandReply, CommandState, EngineStats};

#[cfg(feature = "serial")]
pub use interface::SerialInterface;

pub use test_utils::{MockHandle, MockInterface, TestFixture};

// Protocol constants re-exports
pub use config::{DEFAULT_BAUD_RATE, DEFAULT_GATEWAY_ID, MAX_PAYLOAD_LEN};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(MAX_PAYLOAD_LEN, 48);
        assert_eq!(DEFAULT_BAUD_RATE, 115200);
        assert_eq!(Address::GATEWAY.to_string(), DEFAULT_GATEWAY_ID);
    }
}
