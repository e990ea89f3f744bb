pub mod anon;
pub mod collector;
pub mod config;
pub mod engine;
pub mod listing;
pub mod munin;
pub mod policy;
pub mod request;
pub mod response;
pub mod stats;
pub mod store;
pub mod timestamp;

pub use collector::{CollectError, CollectReport, Collector};
pub use config::{Config, ConfigError};
pub use engine::{Engine, Observation, Verdict};
pub use policy::{Clock, GreylistPolicy, Policy, SystemClock};
pub use request::{Request, RequestError, RequestReader};
pub use response::Response;
pub use store::{SchemaError, Store, StoreError};
pub use timestamp::Timestamp;
