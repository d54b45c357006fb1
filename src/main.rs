//! # 8086 Decoder and Simulator - Executable

use anyhow::{bail, Result};

// Internal imports
use sim86::decode::{decode, DecodeSettings};
use sim86::execute::{
    execute, init_state, load_program, memory_to_file, print_final_state, ExecuteSettings,
};
use sim86::file_to_byte_vec;
use sim86::settings::{parse_args, print_help, MainSettings, RunMode};

fn main() -> Result<()> {
    // Parse args. Fail if incorrect args are given
    let (main_settings, decode_settings, execute_settings) = parse_args()?;

    if main_settings.help {
        print_help();
        return Ok(());
    }

    let program = file_to_byte_vec(&main_settings.input_file)?;

    match main_settings.mode {
        RunMode::Disassemble => disassemble(&main_settings, &program, &decode_settings),
        RunMode::Execute => simulate(&main_settings, &program, &execute_settings),
    }
}

/// Decode the program front to back and print the assembly to stdout. A
/// failed decode still prints everything decoded before it.
fn disassemble(
    settings: &MainSettings,
    program: &[u8],
    decode_settings: &DecodeSettings,
) -> Result<()> {
    println!("; {}", settings.input_file);
    println!("bits 16");

    let (insts, error) = decode(program, decode_settings);
    for inst in &insts {
        println!("{inst}");
    }

    if let Some(e) = error {
        println!("; Failed beyond this point");
        eprintln!("ERROR: {e}");
        bail!("decoding {} failed", settings.input_file);
    }
    Ok(())
}

/// Simulate the program, print the per-instruction trace and the final
/// register state, and optionally dump memory. A failed run still prints
/// the state accumulated so far.
fn simulate(
    settings: &MainSettings,
    program: &[u8],
    execute_settings: &ExecuteSettings,
) -> Result<()> {
    let mut state = init_state();
    load_program(&mut state, program, settings.load_offset as usize);

    println!("--- {} execution ---", settings.input_file);
    let (lines, error) = execute(&mut state, execute_settings);
    for line in &lines {
        println!("{line}");
    }
    for line in print_final_state(&state) {
        println!("{line}");
    }

    if settings.dump {
        memory_to_file(&state.memory, &format!("dump_{}.data", settings.input_file))?;
    }

    if let Some(e) = error {
        eprintln!("ERROR: {e}");
        bail!("executing {} failed", settings.input_file);
    }
    Ok(())
}
