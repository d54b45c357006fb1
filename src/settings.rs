//! Settings
//!
//! This module defines all command-line arguments, the settings structs they
//! are split into, and the parsing functions.

use anyhow::{bail, Result};
use std::env;

use crate::decode::DecodeSettings;
use crate::execute::{ExecuteSettings, DEFAULT_STEP_LIMIT};

/// What to do with the input file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    Disassemble,
    Execute,
}

/// Top-level settings.
pub struct MainSettings {
    pub input_file: String,
    pub mode: RunMode,
    pub help: bool,
    /// Write the memory buffer to `dump_<input>.data` after execution.
    pub dump: bool,
    /// Where in memory the program image is placed, and where IP starts.
    pub load_offset: u16,
}

/// A custom struct holding parsed command line arguments.
#[derive(Default)]
struct ArgsType {
    /// The file to decode or execute.
    input_file: Option<String>,
    mode: Option<RunMode>,
    help: bool,
    verbose: bool,
    /// If true, write the memory buffer to a file after execution.
    dump: bool,
    /// If specified, stop execution after this many instructions.
    exit_after: Option<u64>,
    /// If specified, load the program at this offset instead of 0.
    org: Option<u16>,
    /// The value to initialize the stack pointer to.
    init_sp: Option<u16>,
}

#[derive(PartialEq, Eq, Debug)]
enum ArgType {
    /// This arg is a flag, and does not have a value after it.
    NoValue,
    /// Get the input file for disassembly.
    DisasmFile,
    /// Get the input file for execution.
    ExecFile,
    /// Get a value for the instruction cap.
    ExitAfter,
    /// Get a value for the load offset.
    Org,
    /// Get a value for the initial SP.
    InitSp,
}

const USAGE: &str = "Usage: sim86 [OPTIONS] -disasm|-exec <input>";
const HELP: &str = "
An 8086 instruction decoder and simulator.

Modes (one is required):

-disasm <input> : Decode the binary file <input> and print the assembly to
                  stdout.

-exec <input> : Decode and simulate the binary file <input>, tracing each
                instruction's effects and printing the final register state.

Options:

-h|-help : Print this help message.

-v|-verbose : Print each opcode byte as it is decoded.

-dump : In exec mode, write the full 1 MiB memory buffer to
        dump_<input>.data on exit.

-exit-after <value> : Stop execution after <value> instructions. Bounds
                      programs that never terminate on their own (the
                      default cap is 65536).

-org <value> : Load the program at this memory offset instead of 0, and
               start the IP there. Accepts decimal, 0x-prefixed hex, or
               hex with a trailing h.

-sp <value> : Initialize the stack pointer to this value. Accepts the same
              number formats as -org.
";

pub fn print_help() {
    println!("{USAGE}");
    println!("{HELP}");
}

/// Parse a numeric argument value as decimal, 0x-prefixed hex, or hex with
/// a trailing h.
fn parse_number(arg: &str) -> Result<u64> {
    let val = if arg.starts_with("0x") || arg.starts_with("0X") {
        u64::from_str_radix(&arg[2..], 16)?
    } else if arg.ends_with('h') || arg.ends_with('H') {
        u64::from_str_radix(&arg[..arg.len() - 1], 16)?
    } else {
        arg.parse()?
    };
    Ok(val)
}

fn parse_arg_value(arg: String, arg_type: &ArgType, parsed_args: &mut ArgsType) -> Result<()> {
    match arg_type {
        ArgType::NoValue => unreachable!(),
        ArgType::DisasmFile => {
            parsed_args.mode = Some(RunMode::Disassemble);
            parsed_args.input_file = Some(arg);
        }
        ArgType::ExecFile => {
            parsed_args.mode = Some(RunMode::Execute);
            parsed_args.input_file = Some(arg);
        }
        ArgType::ExitAfter => {
            parsed_args.exit_after = Some(parse_number(&arg)?);
        }
        ArgType::Org => {
            parsed_args.org = Some(parse_number(&arg)? as u16);
        }
        ArgType::InitSp => {
            parsed_args.init_sp = Some(parse_number(&arg)? as u16);
        }
    };
    Ok(())
}

/// Take a given arg and parse it as an optional argument. Modify parsed_args.
/// Return whether the next argument is a value for this argument.
fn parse_optional(arg: String, parsed_args: &mut ArgsType) -> Result<ArgType> {
    if arg == "-h" || arg == "-help" || arg == "--help" {
        parsed_args.help = true;
        Ok(ArgType::NoValue)
    } else if arg == "-v" || arg == "-verbose" {
        parsed_args.verbose = true;
        Ok(ArgType::NoValue)
    } else if arg == "-dump" {
        parsed_args.dump = true;
        Ok(ArgType::NoValue)
    } else if arg == "-disasm" {
        Ok(ArgType::DisasmFile)
    } else if arg == "-exec" {
        Ok(ArgType::ExecFile)
    } else if arg == "-exit-after" {
        Ok(ArgType::ExitAfter)
    } else if arg == "-org" {
        Ok(ArgType::Org)
    } else if arg == "-sp" {
        Ok(ArgType::InitSp)
    } else {
        bail!("Unexpected optional arg '{arg}'\n{USAGE}");
    }
}

/// Take the given arg and parse it as a positional argument. Only the input
/// file can appear positionally, and only once.
fn parse_positional(arg: String, parsed_args: &mut ArgsType) -> Result<()> {
    match &parsed_args.input_file {
        None => {
            parsed_args.input_file = Some(arg);
            Ok(())
        }
        Some(_) => bail!("Unexpected positional arg '{arg}'\n{USAGE}"),
    }
}

/// Parse command line arguments into settings structs: the top-level
/// settings, then decode- and execute-specific ones.
pub fn parse_args() -> Result<(MainSettings, DecodeSettings, ExecuteSettings)> {
    args_to_settings(parse_arg_strings(env::args().collect())?)
}

fn parse_arg_strings(args: Vec<String>) -> Result<ArgsType> {
    let mut parsed_args = ArgsType {
        ..Default::default()
    };

    let mut get_arg_value = ArgType::NoValue;
    // Now parse args, excluding the executable name
    for arg in args.into_iter().skip(1) {
        if get_arg_value != ArgType::NoValue {
            // This argument is a value for the previous argument
            parse_arg_value(arg, &get_arg_value, &mut parsed_args)?;
            get_arg_value = ArgType::NoValue;
        } else if arg.starts_with('-') {
            get_arg_value = parse_optional(arg, &mut parsed_args)?;
        } else {
            parse_positional(arg, &mut parsed_args)?;
        }
    }

    if get_arg_value != ArgType::NoValue {
        bail!("Missing value for the last argument\n{USAGE}");
    }

    Ok(parsed_args)
}

/// Split up ArgsType into the various settings structs. Fails when a
/// required argument is missing (unless -h was given).
fn args_to_settings(args: ArgsType) -> Result<(MainSettings, DecodeSettings, ExecuteSettings)> {
    let (mode, input_file) = match (args.help, args.mode, args.input_file) {
        // Don't check required args with -h; the caller prints help and
        // quits before touching the input file
        (true, mode, input) => (
            mode.unwrap_or(RunMode::Disassemble),
            input.unwrap_or_default(),
        ),
        (_, None, _) => bail!("Missing required arg -disasm or -exec\n{USAGE}"),
        (_, _, None) => bail!("Missing required input file\n{USAGE}"),
        (_, Some(mode), Some(input)) => (mode, input),
    };

    let main_settings = MainSettings {
        input_file,
        mode,
        help: args.help,
        dump: args.dump,
        load_offset: args.org.unwrap_or(0),
    };

    let decode_settings = DecodeSettings {
        verbose: args.verbose,
    };

    let execute_settings = ExecuteSettings {
        init_ip: args.org,
        init_sp: args.init_sp,
        exit_after: args.exit_after.unwrap_or(DEFAULT_STEP_LIMIT),
    };

    Ok((main_settings, decode_settings, execute_settings))
}
