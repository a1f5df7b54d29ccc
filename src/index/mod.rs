//! Vector index management: index features, raster groups, resolvers.

mod groups;
mod resolver;
mod vector_index;

pub use groups::{GroupOrdering, RasterDescriptor, RasterGroup, RasterTag};
pub use resolver::{FixedResolver, GeocellResolver, IndexResolver};
pub use vector_index::{IndexFeature, VectorIndex, FLAGS_FIELD, VALUE_FIELD};
