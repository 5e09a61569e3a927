pub mod merge;
pub mod node;
pub mod perf;
pub mod profile;
pub mod profiler;
pub mod resources;
pub mod script;
pub mod stop;
pub mod util;
