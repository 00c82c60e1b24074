//! Command construction for the external encoder and ripper.

pub mod makemkv;
pub mod profile;

pub use makemkv::{info_command, rip_command, RIPPER_PROGRAM};
pub use profile::{build_command, output_path, EncodeRequest};
