pub mod fingerprint;
pub mod ids;
pub mod logging;
