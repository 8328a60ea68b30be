//! Recovery of the Xenon system-area flash filesystem.
//!
//! The filesystem keeps all of its metadata in the spare (out-of-band) area of each NAND page, in
//! one of three bit-packed layouts depending on the flash geometry, or (on eMMC parts) in a small
//! anchor block. Given a [`nand::Flash`] that can hand back block contents, a
//! [`DecodingSession`] resolves the current FSRoot and Mobile containers, rebuilds the logical
//! block map and extracts files by walking their cluster chains.

pub mod geometry;
pub mod nand;
pub mod session;
pub mod xenonfs;

pub use session::{DecodingSession, SessionOptions};
pub use xenonfs::{Error, Result};
