pub mod loader;
pub mod preprocess;
