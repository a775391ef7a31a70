pub mod error;
pub mod store;
pub mod types;

pub use error::{GraphError, Result};
pub use store::GraphStore;
pub use types::{EntityNode, EntityRelations, GraphStats, RelationEdge, Triplet};
