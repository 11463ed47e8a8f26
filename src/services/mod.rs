//! # External Collaborators
//!
//! Interfaces to the systems the task engine drives but does not implement:
//! the flow engine, the courier's outbound queues, search, IVR call initiation,
//! Android channel syncing, and the cached per-org asset bundle.

pub mod android;
pub mod assets;
pub mod courier;
pub mod engine;
pub mod ivr;
pub mod search;

pub use android::{AndroidSyncer, FcmSyncer};
pub use assets::{AssetCache, AssetLoader, OrgAssets, OrgAssetsProvider, Refresh};
pub use courier::{Courier, MemoryCourier, RedisCourier};
pub use engine::{EngineEvent, EngineInput, FlowEngine, UnconfiguredEngine};
pub use ivr::{CallOutcome, IvrService};
pub use search::{DisabledSearch, ElasticSearchClient, SearchClient};
