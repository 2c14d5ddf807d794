#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod batch;
pub mod kernel;
pub mod model;
pub mod pipeline;
pub mod postprocess;
pub mod types;
