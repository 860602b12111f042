//! USB/IP client engine
//!
//! Imports USB devices exported by a remote USB/IP host and forwards USB
//! transfers to them over TCP.
//!
//! # Layers
//!
//! - [`network::transport`]: resolve and connect with address fallback
//! - [`network::handshake`]: import and device-list exchanges
//! - [`network::correlation`]: match replies to submitted transfers
//! - [`virtual_usb`]: port table, device sessions and their coordinator
//!
//! # Example
//!
//! ```no_run
//! use client::network::{DeviceLocation, SubmitRequest};
//! use client::virtual_usb::{NullHost, VirtualUsbManager};
//! use client::config::ClientConfig;
//! use protocol::BusId;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = VirtualUsbManager::new(&ClientConfig::default(), Arc::new(NullHost));
//! let location = DeviceLocation::new("192.168.1.20", "3240", BusId::new("1-1")?);
//!
//! let session = manager.attach(location, &CancellationToken::new()).await?;
//! let completion = session.submit(&SubmitRequest::transfer_in(1, 64))?.await?;
//! println!("read {} bytes", completion.actual_length);
//!
//! session.detach(&CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod network;
pub mod virtual_usb;

pub use error::{AttachError, DetachError, HandshakeError, RequestError, TransportError};
