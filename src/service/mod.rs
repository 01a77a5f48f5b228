pub mod signals;

pub use signals::setup_shutdown_handler;
