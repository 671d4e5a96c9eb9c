pub mod codec;
pub mod connection;
pub mod handshake;
