// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod caches;
pub mod koios;
pub mod utils;

pub use utils::*;
