pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod flow;
pub mod format;
pub mod output;
pub mod pipeline;
pub mod playback;
pub mod resample;
pub mod ring;
pub mod session;
pub mod status;
pub mod transfer;

mod feed;

#[cfg(test)]
mod testing;
