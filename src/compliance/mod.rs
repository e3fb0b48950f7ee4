mod backend;
mod backends;
mod classifier;

pub use backend::PpeBackend;
#[cfg(feature = "classifier-http")]
pub use backends::HttpPpeBackend;
pub use backends::ScriptedPpeBackend;
pub use classifier::ComplianceClassifier;
