pub mod audio;
pub mod config;
pub mod error;
pub mod nes;

pub use audio::AudioQueue;
pub use config::Config;
pub use error::NesError;
pub use nes::Nes;
