//! Kinformer kubehub: backend transport, discovery, watch channel and informer wiring

#![forbid(unsafe_code)]

pub mod bus;
pub mod discovery;
pub mod informer;
pub mod mock;
pub mod transport;
pub mod watch;

pub use bus::{MutationBus, MutationNotice};
pub use discovery::{ApiResourceDescriptor, ApiVersionResourceCache, DiscoveryRegistry};
pub use informer::{InformerConfig, InformerSink, ResourceInformer, StopHandle};
pub use transport::{ApiRequest, HttpTransport, Transport, Verb, WatchChunk, WatchMode, WatchRequest, WatchSource};
pub use watch::{Backoff, ChannelState, Heartbeat};
