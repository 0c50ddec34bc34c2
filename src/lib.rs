#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

pub mod config;
pub mod delivery;
pub mod error;
pub mod queue;
pub mod service;
pub mod store;
pub mod subscriptions;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use delivery::{DeliveryEngine, DeliveryStats};
pub use error::OutpostError;
pub use queue::{QueueLimits, QueueStore, Retention};
pub use service::{ActiveTransport, Enqueuer, Outpost, OutpostBuilder};
pub use store::{MemoryStore, PersistentStore, SqliteStore};
pub use transport::{PollClient, SocketConnector, SocketFrame, SocketSession};

