mod graph;
pub use graph::*;

mod json_export;
pub use json_export::*;

mod labels;
pub use labels::*;

pub mod postgis;
pub use postgis::{DatabaseConfig, PostgisLoader, PostgisTables};

mod split;
pub use split::*;

mod traits;
pub use traits::*;
