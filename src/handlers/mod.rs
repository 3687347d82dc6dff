//! 핸들러 모듈

pub mod connection;
pub mod consumer;
pub mod ice;
pub mod producer;
pub mod room;
pub mod signaling;
pub mod transport;
pub mod worker;

pub use connection::*;
pub use consumer::*;
pub use ice::*;
pub use producer::*;
pub use room::*;
pub use signaling::*;
pub use transport::*;
pub use worker::*;
