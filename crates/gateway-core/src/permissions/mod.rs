pub mod bits;
pub mod cache;
pub mod invalidator;
pub mod resolver;

pub use cache::PermissionCache;
pub use invalidator::{InvalidationMessage, PermissionInvalidator};
pub use resolver::PermissionResolver;
