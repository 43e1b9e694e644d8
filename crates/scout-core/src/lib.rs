//! # scout-core: Pure Decode Logic for Scout
//!
//! This crate holds the data-shape half of the bridge: decoding raw BLE
//! advertising payloads and describing the observation records the pipeline
//! publishes. It has zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Scout Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Radio event source (external)                   │   │
//! │  │            raw advertising reports, RSSI, addresses             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ scout-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐  ┌───────────────┐  ┌───────────────────┐  │   │
//! │  │   │     adv       │  │  observation  │  │      error        │  │   │
//! │  │   │  AD fields    │  │  Observation  │  │    CoreError      │  │   │
//! │  │   │  local names  │  │  JSON record  │  │                   │  │   │
//! │  │   └───────────────┘  └───────────────┘  └───────────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO HARDWARE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                scout-bridge (event queue → transport)           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`adv`] - Advertising data (AD structure) decoding
//! - [`observation`] - The observation record the pipeline publishes
//! - [`error`] - Decode error types

pub mod adv;
pub mod error;
pub mod observation;

pub use adv::{find_service_uuid, parse_local_names, AdField, AdFieldIter, LocalNames};
pub use error::{CoreError, CoreResult};
pub use observation::Observation;
