pub mod analyze;
pub mod bundle;
pub mod domain;
pub mod endpoint;
mod engine;
pub mod export_stream;
pub(crate) mod fsio;
pub mod httpc;
pub mod import_stream;
pub mod normalize;
pub mod obfuscate;
pub mod profiles;
pub mod retention;
#[cfg(test)]
pub(crate) mod test_support;
pub mod verify;
pub mod vmclient;

pub use analyze::{AnalysisMode, AnalyzeOptions};
pub use domain::*;
pub use engine::{EngineError, EngineOptions, FerryEngine, UploadRequest};
pub use export_stream::ExportRun;
pub use import_stream::StreamError;
pub use profiles::{ProfileStore, RecentProfile, RecentProfiles};
pub use vmclient::{HttpVmExporter, VmExporter};
