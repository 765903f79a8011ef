//! # sipmux Control Plane
//!
//! The client-facing control plane of the sipmux SIP signaling server.
//! Remote applications connect over a framed TCP channel, authenticate
//! with a shared secret, and declare which SIP verbs and app names they
//! serve; the control plane then routes every inbound SIP event to exactly
//! one of them and carries their commands back down into the SIP engine.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────────┐
//!    SIP engine ──────▶│  SipEventAdapter │
//!  (DialogController   └──────────────────┘
//!   / ProxyController)          │ lookup
//!                      ┌──────────────────┐
//!                      │   ClientRouter   │  verb / app-name / dialog /
//!                      └──────────────────┘  transaction / api indexes
//!                               │ deliver
//!                      ┌──────────────────┐
//!                      │  ClientSession   │──▶ length-prefixed frames
//!                      └──────────────────┘       over TCP
//! ```
//!
//! Commands flow the other way: a session parses a control message,
//! records its correlation ids in the router, and dispatches into the
//! engine through the controller traits. Dialog affinity is preserved
//! across client failures by failing over to another client advertising
//! the same app name.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sipmux_control_plane::prelude::*;
//! # use sipmux_control_plane::engine::{DialogController, ProxyController};
//!
//! # async fn example(
//! #     dialog: Arc<dyn DialogController>,
//! #     proxy: Arc<dyn ProxyController>,
//! # ) -> sipmux_control_plane::Result<()> {
//! let mut config = ControlPlaneConfig::default();
//! config.shared_secret = "s3cret".to_string();
//! config.advertised_hostports = vec!["198.51.100.10:5060".to_string()];
//!
//! let plane = ControlPlane::new(config, dialog, proxy)?;
//! let adapter = plane.adapter(); // hand this to the SIP engine
//! let handle = plane.clone().start().await?;
//! # let _ = adapter;
//! // ... run ...
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod client;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod router;
pub mod server;

pub use adapter::SipEventAdapter;
pub use client::{ClientDirection, ClientHandle, ClientId, ClientState};
pub use config::ControlPlaneConfig;
pub use engine::{DialogController, MessageSource, ProxyController, ProxyOptions, SipMessageInfo};
pub use error::{Error, Result};
pub use router::{ClientRouter, RouterStats};
pub use server::{ControlPlane, ServerHandle};

/// Commonly used types for embedding the control plane
pub mod prelude {
    pub use crate::adapter::SipEventAdapter;
    pub use crate::client::{ClientDirection, ClientId, ClientState};
    pub use crate::config::ControlPlaneConfig;
    pub use crate::engine::{
        DialogController, MessageSource, ProxyController, ProxyOptions, SipMessageInfo,
    };
    pub use crate::error::{Error, Result};
    pub use crate::router::{ClientRouter, RouterStats};
    pub use crate::server::{ControlPlane, ServerHandle};
}
