mod context;
pub mod errors;
pub mod factory;
mod service;

pub use context::AppContext;
pub use errors::AppError;
pub use factory::{AppFactory, AppPaths, LedgerAccess};
pub use service::{Health, SearchHit};

#[cfg(test)]
pub use service::{image_path, IngestReport};
