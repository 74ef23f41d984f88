pub mod callgraph;
pub mod changes;
pub mod chunks;
pub mod filesystem;
pub mod imports;
pub mod parser;
pub mod pipeline;
