// Query module - statement model, generation and execution
pub mod executor;
pub mod generator;
pub mod statement;

pub use executor::{CqlExecutor, ResultFuture, ResultTable};
pub use statement::{Select, Statement};
