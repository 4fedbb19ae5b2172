pub mod audit;
pub mod error;
pub mod executor;
pub mod parser;
pub mod reader;
pub mod utils;
pub mod verifier;
