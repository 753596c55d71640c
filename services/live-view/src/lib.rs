//! Live Inventory View
//!
//! Maintains a live, role-aware view over the inventory snapshot feed:
//! - Session resolution with fail-closed roles
//! - Aggregation of snapshots into totals and chart series
//! - Bounded, newest-first history with freshness marking
//! - One managed feed subscription per view context, with reconnect backoff
//! - Role-gated presentation of aggregate and history fields
//!
//! # Architecture
//!
//! ```text
//!   SnapshotFeed            AuthProvider / ProfileStore
//!        │                            │
//!  ┌─────▼──────┐              ┌──────▼──────┐
//!  │Subscription│              │  Session    │
//!  │  Manager   │              │  Resolver   │
//!  └──┬──────┬──┘              └──────┬──────┘
//!     │      │                        │
//! ┌───▼───┐ ┌▼─────────┐              │
//! │History│ │Aggregator│              │
//! └───┬───┘ └┬─────────┘              │
//!     │      │                        │
//!  ┌──▼──────▼────────────────────────▼──┐
//!  │        Role Gate / ViewContext      │
//!  └─────────────────────────────────────┘
//! ```

pub mod aggregator;
pub mod config;
pub mod context;
pub mod feed;
pub mod history;
pub mod memory;
pub mod metrics;
pub mod role_gate;
pub mod session;
pub mod subscription;

pub use aggregator::{aggregate, AggregateView, ChartSeries};
pub use config::{ChartConfig, ReconnectPolicy, ViewConfig};
pub use context::{ContextView, ViewContext};
pub use feed::{FeedEvent, FeedSink, QueryDescriptor, SnapshotFeed, Unsubscribe};
pub use history::{HistoryEntry, HistoryWindow, PushOutcome};
pub use role_gate::{PresentedView, RoleGate};
pub use session::{AuthEvent, AuthProvider, ProfileStore, SessionResolver};
pub use subscription::{LiveState, SubscriptionHandle, SubscriptionManager, SubscriptionPhase};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
