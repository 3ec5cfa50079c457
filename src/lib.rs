pub mod relay;

pub use relay::config::RelayConfig;
pub use relay::manager::Relay;
pub use relay::transport::{FrameHandler, WebSocketSource};

/**
 * Install the env_logger backend
 * RUST_LOG overrides the defaults: warn globally, info for the relay
 */
pub fn init_logging() {
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("prun_relay", log::LevelFilter::Info)
        .parse_env("RUST_LOG")
        .format_timestamp_millis()
        .try_init();
}
