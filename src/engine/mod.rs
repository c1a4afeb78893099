// Scene preparation: workspace, asset fetching, config compilation and engine runs.

pub mod compiler;
pub mod error;
pub mod fetcher;
pub mod invoker;
pub mod pipeline;
pub mod tools;
pub mod workspace;
