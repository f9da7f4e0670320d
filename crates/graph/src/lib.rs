pub mod error;
pub mod ids;
pub mod store;

pub use error::GraphError;
pub use ids::{event_id, plot_id};
pub use store::GraphStore;
