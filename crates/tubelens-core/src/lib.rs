//! tubelens core: incremental AI analysis stream consumer
//!
//! Consumes a server-sent event stream from an analysis endpoint and exposes
//! an observable session state:
//! - Stage progress for a fixed list of pipeline stages
//! - Live text as it streams in
//! - The final result or a user-visible error
//!
//! Falls back to a non-streaming endpoint when the server has no stream route.

pub mod cancellation;
pub mod config;
pub mod error;
pub mod events;
pub mod fallback;
pub mod request;
pub mod session;
pub mod sse;
pub mod stages;
pub mod transport;

pub use cancellation::SessionCancellation;
pub use config::{AnalysisKind, Config};
pub use error::{ConfigError, FrameError, TransportError};
pub use events::{AnalysisResult, StreamEvent};
pub use request::AnalysisRequest;
pub use session::{ConsumerOptions, SessionHandle, SessionOutcome, SessionState, StreamConsumer};
pub use stages::{StageDefinition, StageStatus, StageTracker};
pub use transport::{AnalysisTransport, HttpTransport};
