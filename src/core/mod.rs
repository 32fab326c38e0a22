//! Core analysis state: socket attribution, classification, stream tracking.

pub mod classifier;
pub mod port_mapper;
pub mod process_scanner;
pub mod tcp_stream;
