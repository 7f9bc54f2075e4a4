pub mod assets;
pub mod response;
pub mod sse;
