//! easel: client-side lifecycle manager for asynchronous image predictions.

pub mod client;
pub mod inline;
pub mod manager;
mod output;
pub mod poller;
mod prediction;
mod registry;
mod session;
pub mod store;
mod version;

pub use client::{ClientConfig, HttpPredictionClient, PredictionApi, RemoteServiceError};
pub use inline::{AssetInliner, ConversionError, Inlined};
pub use manager::{ManagerError, OutputManager, PollOutcome, PollReport};
pub use output::{
    AspectRatio, BASE_SIZE, InvalidAspectRatio, OUTPUT_ID_PREFIX, Output, Placement,
    PlacementUpdate,
};
pub use poller::{CancellationToken, PollerConfig, SingleFlight};
pub use prediction::{PredictionStatus, RemoteJob};
pub use registry::OutputRegistry;
pub use session::{CREDENTIAL_KEY, OUTPUTS_KEY, SessionState};
pub use store::{FileStore, MemoryStore, SessionStore, StoreError};
pub use version::{EASEL_VERSION, user_agent};
