pub mod loader;
pub mod mutations;
pub mod resolvers;
pub mod schema;
