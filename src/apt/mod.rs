//! APT wire layer.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        APT Stack                             │
//! │                                                              │
//! │  ┌───────────┐   ┌──────────┐   ┌─────────────────────────┐  │
//! │  │ PortReader│──▶│  Codec   │──▶│ Dispatcher (by cmd id)  │  │
//! │  │ (trait)   │   │ (framing)│   │ → state / Waiter / EFS  │  │
//! │  └───────────┘   └──────────┘   └─────────────────────────┘  │
//! │                                                              │
//! │  ┌───────────┐   ┌──────────────────┐                        │
//! │  │ PortWriter│◀──│ OutboundScheduler│◀── send / send_asap    │
//! │  │ (trait)   │   │ (priority+pacing)│                        │
//! │  └───────────┘   └──────────────────┘                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod dispatch;
pub mod payload;
pub mod protocol;
pub mod transport;
pub mod waiter;
