pub mod casparcg;
pub mod hyperdeck;
pub mod osc_listener;
pub mod vmix;
