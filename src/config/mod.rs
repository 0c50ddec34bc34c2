pub mod schema;

#[allow(unused_imports)]
pub use schema::{
    ClientConfig, Config, DeliveryConfig, EndpointsConfig, PollerConfig, ResendOrder,
    SocketConfig, StorageBackend, StorageConfig,
};
