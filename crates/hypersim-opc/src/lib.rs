//! Hypersim OPC - Open Pixel Control server core
//!
//! This crate receives a stream of pixel updates over Open Pixel Control
//! (OPC) and hands color-corrected frames to a consumer:
//! - **Protocol**: header/payload framing, command decoding, message encoding
//! - **SysEx**: global color correction (gamma + whitepoint) and firmware flags
//! - **Color**: lookup-table based color correction, swapped atomically
//! - **Dispatch**: command routing and the standby gate
//! - **Server**: TCP listener with one task per connection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hypersim_opc::{Frame, OpcServer, OpcServerConfig, PixelSink};
//!
//! # async fn run() -> hypersim_opc::Result<()> {
//! let sink = |frame: &Frame| println!("{} pixels", frame.len());
//! let server = OpcServer::start(OpcServerConfig::new(7890), Some(Arc::new(sink) as Arc<dyn PixelSink>)).await?;
//!
//! // Rebuild rendering state without racing pixel updates
//! let guard = server.standby().await?;
//! drop(guard);
//!
//! server.stop();
//! server.stopped().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - OPC wire format
//! - [`color`] - Color correction
//! - [`dispatch`] - Command dispatcher
//! - [`server`] - TCP server
//! - [`error`] - Error types

#![allow(missing_docs)]

/// Color correction lookup tables
pub mod color;
/// Command routing and standby
pub mod dispatch;
/// Error types
pub mod error;
/// OPC wire format
pub mod protocol;
/// TCP server
pub mod server;

// Re-exports
pub use color::{ColorChannel, ColorCorrectionParams, ColorCorrector, LookupTable};
pub use dispatch::{CommandDispatcher, DispatchOutcome, PixelSink, StandbyGuard};
pub use error::{OpcError, Result};
pub use protocol::sysex::{FirmwareFlags, FirmwareFlagsUpdate, SysExMessage};
pub use protocol::{Command, Frame, Header, Pixel};
pub use server::{CloseReason, OpcServer, OpcServerConfig};
