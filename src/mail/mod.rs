pub mod decoders;
pub mod graph;
pub mod provider;
