// Copyright 2017, Romuald Texier-Marcadé <romualdtm@gmail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/license/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option.  This file may not be copied, modified, or distributed
// except according to those terms.

//! A protocol engine for BidCoS, the wireless home-automation protocol
//! used by HomeMatic devices.
//!
//! This crate owns the parts of a BidCoS gateway that do not depend on
//! any particular RPC/device-description layer: frame parsing, the
//! duplicate-reception cache, the AES-128 challenge/response handshake,
//! per-peer send queues with retry, and the three physical-interface
//! backends (CUL serial, COC/CUNO serial-over-TCP, CC1101 SPI) that
//! actually put bytes on the air.
//!
//! # Usage
//!
//! Add a dependency to `bidcos_gateway` in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! bidcos_gateway = "0.1.0"
//! ```
//!
//! A minimal setup wires one interface, a `QueueManager`, and an
//! `AesHandshake` together and starts listening:
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//!
//! use bidcos_gateway::config::GatewayConfig;
//! use bidcos_gateway::queue_manager::QueueManager;
//! use bidcos_gateway::transport::cul::{Cul, CulConfig};
//! use bidcos_gateway::transport::RadioTransport;
//!
//! let config = GatewayConfig::load("gateway.toml").unwrap();
//! let peers = Arc::new(Mutex::new(HashMap::new()));
//! let queues = QueueManager::new(peers);
//! let cul = Cul::new(CulConfig::default());
//! cul.start_listening().unwrap();
//! ```

pub mod aes_handshake;
pub mod central;
pub mod config;
pub mod error;
pub mod packet;
pub mod packet_manager;
pub mod peer;
pub mod queue;
pub mod queue_manager;
pub mod transport;

pub use aes_handshake::AesHandshake;
pub use central::{Central, DispatchOutcome};
pub use config::GatewayConfig;
pub use error::{AesError, GatewayError, TransportError};
pub use packet::Packet;
pub use packet_manager::PacketManager;
pub use peer::{Peer, PeerInfo};
pub use queue::{BidCoSQueue, QueueStep, QueueType};
pub use queue_manager::QueueManager;
