pub mod app;
pub mod barrier;
pub mod config;
pub mod frame;
pub mod logging;
pub mod net;
pub mod point;
pub mod promise;
pub mod proxy;
pub mod session;
pub mod store;
pub mod sublog;
pub mod tunnel;

pub use app::AppError;

pub async fn run(config_path: Option<std::path::PathBuf>) -> Result<(), AppError> {
    app::run(config_path).await
}
