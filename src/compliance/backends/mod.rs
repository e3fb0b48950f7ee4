pub mod scripted;

#[cfg(feature = "classifier-http")]
pub mod http;

pub use scripted::ScriptedPpeBackend;

#[cfg(feature = "classifier-http")]
pub use http::HttpPpeBackend;
