pub mod device;
pub mod glow;
pub mod s101;
pub mod timecode;
pub mod tsl;

/// Default control ports per device type
pub const DEFAULT_HYPERDECK_PORT: u16 = 9993;
pub const DEFAULT_VMIX_PORT: u16 = 8088;
pub const DEFAULT_CASPARCG_PORT: u16 = 6250;

/// Default output ports
pub const DEFAULT_EMBER_PORT: u16 = 9000;
pub const DEFAULT_TSL_PORT: u16 = 4003;
pub const DEFAULT_WEBSOCKET_PORT: u16 = 8090;

/// Default timing
pub const DEFAULT_FRAMERATE: f64 = 25.0;
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_VMIX_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_OSC_STALE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_TSL_REFRESH_INTERVAL_MS: u64 = 200;

/// HyperDeck reconnect backoff bounds
pub const RECONNECT_INITIAL_MS: u64 = 1000;
pub const RECONNECT_MAX_MS: u64 = 30_000;
