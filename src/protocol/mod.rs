//! 시그널링 프로토콜

mod messages;

pub use messages::*;
