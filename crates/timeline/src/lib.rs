mod cache;
mod collab;
mod config;
mod distribution;
mod error;
mod fingerprint;
mod handler;
mod manager;
mod state;

pub use cache::MemoryCache;
pub use collab::{
    AcceptAll, AuthorRelayHints, ContentFilter, EventCache, NoCache, NoRanking, PopularityRanker,
};
pub use config::EngineConfig;
pub use distribution::{DistributionConfig, DistributionStrategy, SubscriptionRequest, VIDEO_KINDS};
pub use error::Error;
pub use fingerprint::{Fingerprinter, MediaUrlFingerprint, NoFingerprint};
pub use handler::{ChannelHandler, TimelineHandler, TimelineUpdate};
pub use manager::{FeedHealth, SubscriptionHandle, TimelineManager, TimelineManagerBuilder};
pub use state::{
    merge_sorted_vecs, BatchSource, LiveOutcome, MergeKind, Page, Rejection, Settled, TimelineSnapshot,
    TimelineState,
};

pub type Result<T> = std::result::Result<T, error::Error>;
