pub mod camera;
pub mod capture;
pub mod combiner;
pub mod connection;
pub mod gateway;
pub mod hardware;
pub mod merge_engine;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod radio;
pub mod state;
pub mod storage;
pub mod trigger;

pub use camera::{CameraApi, CameraError, RemoteMedia};
pub use capture::{CaptureCoordinator, CaptureError};
pub use combiner::{CombinationQueue, CombineError};
pub use connection::{ConnectionError, ConnectionManager, RetryPolicy};
pub use gateway::{ActivationFailure, ActivationMode, DeviceGateway};
pub use hardware::{DigitalIo, IoLines};
pub use models::{CaptureJob, CombinationJob, ConnectionState, Device};
pub use orchestrator::Orchestrator;
pub use radio::RadioAdapter;
pub use state::ConnectionTracker;
