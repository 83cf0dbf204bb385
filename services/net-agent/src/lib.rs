//! ctnet Net Agent Library
//!
//! The net agent runs on each container host and gives containers routable
//! IPv6 (and, in ipvlan mode, shared IPv4) addresses. It obtains a
//! delegated prefix from the upstream network, keeps containers attached to
//! a managed engine network inside that prefix, and keeps forwarding rules
//! in step with which containers are running.
//!
//! ## Architecture
//!
//! ```text
//! Dhcp6Client / LeaseClient   (address blocks, renewal loops)
//!        │
//!        ▼
//!     NetConf ──► NetworkSelector ──► ManagedNetwork
//!                                          │
//! Reconciler ── events ──► NetAttachListener
//!                          ├── AttachmentManager  (connect/disconnect)
//!                          └── PortRouter         (ip6tables FORWARD)
//! ```
//!
//! ## Modules
//!
//! - `engine`: container engine API and its in-memory mock
//! - `firewall`: forwarding-chain rules
//! - `network`: managed network selection
//! - `attach`: per-container addressing
//! - `ports`: exposed-port routing
//! - `listener`: lifecycle listener interface
//! - `reconciler`: event loop with reconnect
//! - `renew`: prefix and lease renewal loops

pub mod attach;
pub mod config;
pub mod engine;
pub mod firewall;
pub mod listener;
pub mod network;
pub mod ports;
pub mod reconciler;
pub mod renew;

pub use attach::{Attachment, AttachmentManager};
pub use engine::{ContainerEngine, DockerClient, MockEngine};
pub use firewall::{Firewall, Ip6Tables, MemoryFirewall};
pub use listener::{LifecycleListener, NetAttachListener};
pub use network::{ManagedNetwork, NetworkSelector};
pub use ports::PortRouter;
pub use reconciler::{Reconciler, ReconcilerConfig};
