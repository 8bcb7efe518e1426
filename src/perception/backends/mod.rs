pub mod http;
pub mod stub;

pub use http::HttpPerceptionBackend;
pub use stub::StubBackend;
