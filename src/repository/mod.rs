pub mod results;

pub use results::{ResultAggregator, ResultSet};
