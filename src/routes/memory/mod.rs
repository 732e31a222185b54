mod handler;
mod model;

pub use handler::search;
pub use model::{SearchHit, SearchQuery, SearchResponse};
