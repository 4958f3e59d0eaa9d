pub mod registry;

pub use registry::{ToolCatalog, ToolDescriptor};
