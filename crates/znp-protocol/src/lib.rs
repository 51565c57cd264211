//! MT serial protocol for Texas Instruments Z-Stack ZNP coprocessors
//!
//! This crate implements the host side of the Monitor-Test protocol spoken
//! by CC2531 / CC13x2 / CC2652 coordinators: byte-level framing, the typed
//! command registry, the serial transport, and the dispatcher multiplexing
//! one UART across concurrent requests and callback subscribers.

pub mod codec;
pub mod commands;
pub mod cstruct;
pub mod dispatcher;
pub mod frame;
pub mod nvids;
pub mod structs;
pub mod types;
pub mod uart;

pub use commands::{AnyCommand, CommandMatcher, MtCommand, PatternOf, SyncRequest};
pub use dispatcher::{ResponseFuture, Znp, ZnpConfig};
pub use frame::{CommandHeader, CommandType, FrameDecoder, GeneralFrame, Subsystem};
pub use types::ProtocolError;
pub use uart::{FlowControl, SerialConfig};
