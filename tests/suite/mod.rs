mod common;
mod pipeline;
mod resolve;
