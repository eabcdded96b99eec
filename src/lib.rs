//! Dsync Library
//!
//! One-way directory synchronization over a raw byte stream: catalog scan,
//! tolerant diff, and tar streaming of exactly the entries the peer lacks

pub mod catalog;
pub mod diff;
pub mod handshake;
pub mod logger;
pub mod net;
pub mod protocol;
pub mod tar_stream;
