//! # 8086 Decoder and Simulator - Library
//!
//! This crate decodes raw Intel 8086/8088 machine code into NASM-compatible
//! assembly text, and can execute the decoded stream against a simulated CPU
//! (fourteen 16-bit registers and a flat 1 MiB memory), tracing every
//! register, IP, and flag change as it goes.
//!
// Define the modules in this library
pub mod decode;
pub mod execute;
pub mod inst;
pub mod settings;
pub mod stream;
#[cfg(test)]
mod tests;

// Imports
use anyhow::Result;
use std::fs::File;
use std::io::Read;

/// Takes in a file path and returns a byte vector containing the entire
/// contents of the file.
pub fn file_to_byte_vec(input_path: &str) -> Result<Vec<u8>> {
    let mut input_file = File::open(input_path)?;
    let mut inst_stream: Vec<u8> = vec![];
    input_file.read_to_end(&mut inst_stream)?;
    Ok(inst_stream)
}
