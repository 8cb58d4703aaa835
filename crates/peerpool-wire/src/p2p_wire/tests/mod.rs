pub mod utils;

mod pool;
