//! The simulation logic: CPU state, register aliasing, flag arithmetic, and
//! the fetch-decode-execute loop.
//!
//! Execution is driven by the CPU's own CS:IP pair, not by a pre-decoded
//! instruction list: each step fetches from simulated memory at the physical
//! address `(CS << 4) + IP`, decodes one instruction, advances IP by its
//! length, and then applies the instruction's effects. Every step produces a
//! one-line trace of the register, IP, and flag changes it caused.

use std::fs::File;
use std::io::Write;

use bitflags::bitflags;
use thiserror::Error;

use crate::decode::{decode_single, DecodeError, DecodeSettings};
use crate::inst::{reg, Instruction, MemOperand, Mnemonic, OpSize, Operand, RegOperand, SegReg};
use crate::stream::ByteStream;

/// The full 8086 address space.
pub const MEMORY_SIZE: usize = 1024 * 1024;

/// Address mask: the 8086 address bus is 20 bits, so physical addresses wrap
/// at 1 MiB.
const ADDR_MASK: usize = MEMORY_SIZE - 1;

/// Default cap on executed instructions. A legal program can loop forever
/// (`jmp $+0` is two bytes), so the run is bounded; override the cap via
/// [`ExecuteSettings::exit_after`].
pub const DEFAULT_STEP_LIMIT: u64 = 65_536;

/// The ways a simulation run can fail. Decode failures pass through; the
/// rest name the instruction that could not be carried out.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("execution of `{mnemonic}` is not implemented")]
    Unimplemented { mnemonic: String },
}

bitflags! {
    /// The FLAGS register. Bit positions follow figure 2-9 of the manual;
    /// the gaps are reserved bits.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct Flags: u16 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

/// The compact trace notation for the status flags: one letter per set
/// flag, in bit order (`CPAZSO`).
pub fn flag_letters(flags: Flags) -> String {
    let mut letters = String::new();
    if flags.contains(Flags::CF) {
        letters.push('C');
    }
    if flags.contains(Flags::PF) {
        letters.push('P');
    }
    if flags.contains(Flags::AF) {
        letters.push('A');
    }
    if flags.contains(Flags::ZF) {
        letters.push('Z');
    }
    if flags.contains(Flags::SF) {
        letters.push('S');
    }
    if flags.contains(Flags::OF) {
        letters.push('O');
    }
    letters
}

/// Register-file slots. The first eight follow the machine's wide register
/// encoding, then the segment registers, IP, and FLAGS.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reg {
    Ax = 0,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
    Es,
    Cs,
    Ss,
    Ds,
    Ip,
    Flags,
}

const SLOT_NAMES: [&str; 14] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "es", "cs", "ss", "ds", "ip", "flags",
];

/// Execution-specific settings.
pub struct ExecuteSettings {
    /// The value to initially set the IP register to.
    pub init_ip: Option<u16>,
    /// The value to initially set the SP register to.
    pub init_sp: Option<u16>,
    /// Stop the run after this many executed instructions.
    pub exit_after: u64,
}

impl Default for ExecuteSettings {
    fn default() -> Self {
        ExecuteSettings {
            init_ip: None,
            init_sp: None,
            exit_after: DEFAULT_STEP_LIMIT,
        }
    }
}

/// The simulated CPU: fourteen 16-bit registers and a flat 1 MiB memory.
#[derive(Debug)]
pub struct CpuState {
    regs: [u16; 14],
    pub memory: Vec<u8>,
    /// Physical bounds of the loaded program. Execution stops once the IP
    /// leaves this region.
    pub program_start: usize,
    pub program_end: usize,
}

pub fn init_state() -> CpuState {
    CpuState {
        regs: [0; 14],
        memory: vec![0; MEMORY_SIZE],
        program_start: 0,
        program_end: 0,
    }
}

/// Copy a program image into memory at the given offset, record its bounds,
/// and point IP at its first byte.
pub fn load_program(state: &mut CpuState, program: &[u8], offset: usize) {
    state.memory[offset..offset + program.len()].copy_from_slice(program);
    state.program_start = offset;
    state.program_end = offset + program.len();
    state.set_reg(Reg::Ip, offset as u16);
}

/// The physical address of a segment:offset pair, computed in 32-bit
/// arithmetic with no segment-limit checks.
pub fn physical_address(segment: u16, offset: u16) -> usize {
    (((segment as u32) << 4).wrapping_add(offset as u32)) as usize
}

impl CpuState {
    pub fn reg(&self, r: Reg) -> u16 {
        self.regs[r as usize]
    }

    pub fn set_reg(&mut self, r: Reg, val: u16) {
        self.regs[r as usize] = val;
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.regs[Reg::Flags as usize])
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.regs[Reg::Flags as usize] = flags.bits();
    }

    /// The register-file slot a register operand maps to: byte registers
    /// alias the low or high half of their wide slot, segment registers sit
    /// behind the general eight.
    fn slot(reg_op: RegOperand) -> usize {
        if reg_op.segment {
            (reg_op.index & 0b11) as usize + 8
        } else if reg_op.size == OpSize::Byte && reg_op.index >= 4 {
            (reg_op.index - 4) as usize
        } else {
            (reg_op.index & 0b111) as usize
        }
    }

    /// The canonical wide name of the slot a register operand maps to.
    /// Writes to AL or AH both trace as `ax`.
    pub fn wide_name(reg_op: RegOperand) -> &'static str {
        SLOT_NAMES[Self::slot(reg_op)]
    }

    /// Read a register operand with AX/AH/AL-style aliasing.
    pub fn read_register(&self, reg_op: RegOperand) -> u16 {
        let val = self.regs[Self::slot(reg_op)];
        match (reg_op.segment, reg_op.size, reg_op.index >= 4) {
            (true, ..) => val,
            (_, OpSize::Word, _) => val,
            (_, OpSize::Byte, false) => val & 0x00FF,
            (_, OpSize::Byte, true) => val >> 8,
        }
    }

    /// Write a register operand, preserving the untouched half on 8-bit
    /// writes. Returns the old and new values of the whole 16-bit slot, for
    /// tracing.
    pub fn write_register(&mut self, reg_op: RegOperand, val: u16) -> (u16, u16) {
        let slot = Self::slot(reg_op);
        let old = self.regs[slot];
        let new = match (reg_op.segment, reg_op.size, reg_op.index >= 4) {
            (true, ..) => val,
            (_, OpSize::Word, _) => val,
            (_, OpSize::Byte, false) => (old & 0xFF00) | (val & 0x00FF),
            (_, OpSize::Byte, true) => (old & 0x00FF) | ((val & 0x00FF) << 8),
        };
        self.regs[slot] = new;
        (old, new)
    }

    pub fn load_u8(&self, addr: usize) -> u8 {
        self.memory[addr & ADDR_MASK]
    }

    pub fn load_u16(&self, addr: usize) -> u16 {
        let lo = self.memory[addr & ADDR_MASK] as u16;
        let hi = self.memory[(addr + 1) & ADDR_MASK] as u16;
        lo | (hi << 8)
    }

    pub fn store_u8(&mut self, addr: usize, val: u8) {
        self.memory[addr & ADDR_MASK] = val;
    }

    pub fn store_u16(&mut self, addr: usize, val: u16) {
        self.memory[addr & ADDR_MASK] = (val & 0x00FF) as u8;
        self.memory[(addr + 1) & ADDR_MASK] = (val >> 8) as u8;
    }
}

/// Run the fetch-decode-execute loop until the IP leaves the program region,
/// a HLT retires, the step cap is reached, or an error surfaces. Returns the
/// per-instruction trace lines, plus the error if one stopped the run.
pub fn execute(state: &mut CpuState, settings: &ExecuteSettings) -> (Vec<String>, Option<ExecError>) {
    let mut lines = vec![];

    if let Some(ip) = settings.init_ip {
        state.set_reg(Reg::Ip, ip);
    }
    if let Some(sp) = settings.init_sp {
        state.set_reg(Reg::Sp, sp);
    }

    let decode_settings = DecodeSettings::default();
    let mut steps: u64 = 0;
    loop {
        let phys = physical_address(state.reg(Reg::Cs), state.reg(Reg::Ip));
        if phys < state.program_start || phys >= state.program_end {
            break;
        }
        if steps >= settings.exit_after {
            eprintln!("Stopping execution after {steps} instructions");
            break;
        }

        let inst = {
            let window = &state.memory[phys..state.program_end];
            let mut stream = ByteStream::new(window);
            match decode_single(&mut stream, &decode_settings) {
                Ok(inst) => inst,
                Err(e) => return (lines, Some(e.into())),
            }
        };

        match execute_single(&inst, state) {
            Ok(line) => lines.push(line),
            Err(e) => return (lines, Some(e)),
        }
        steps += 1;

        if inst.mnemonic == Mnemonic::Hlt {
            break;
        }
    }

    (lines, None)
}

/// Execute one decoded instruction against the CPU state. Returns the trace
/// line: the instruction text, then ` ; `, then each register change as
/// ` reg:0xold->0xnew`, the IP change, and the flag change if any.
fn execute_single(inst: &Instruction, state: &mut CpuState) -> Result<String, ExecError> {
    let mut effect = inst.to_string();
    effect.push_str(" ;");

    let old_ip = state.reg(Reg::Ip);
    let old_flags = state.flags();

    // While an instruction executes, IP already points at the next one, so
    // relative jumps are taken from the advanced value.
    state.set_reg(Reg::Ip, old_ip.wrapping_add(inst.length));

    match inst.mnemonic {
        Mnemonic::Mov => {
            let size = operand_size(inst);
            let (dst, src) = binary_operands(inst);
            let val = read_operand(state, src, size)?;
            write_operand(state, &mut effect, dst, size, val)?;
        }
        m @ (Mnemonic::Add | Mnemonic::Adc | Mnemonic::Sub | Mnemonic::Sbb | Mnemonic::Cmp) => {
            let size = operand_size(inst);
            let (dst, src) = binary_operands(inst);
            let lhs = read_operand(state, dst, size)?;
            let rhs = read_operand(state, src, size)?;
            let carry_in = state.flags().contains(Flags::CF);
            let (result, overflow, carry, aux) = match m {
                Mnemonic::Add => add_with_flags(lhs, rhs, false, size),
                Mnemonic::Adc => add_with_flags(lhs, rhs, carry_in, size),
                Mnemonic::Sbb => sub_with_flags(lhs, rhs, carry_in, size),
                _ => sub_with_flags(lhs, rhs, false, size),
            };
            apply_arith_flags(state, size, result, overflow, carry, aux);
            if m != Mnemonic::Cmp {
                write_operand(state, &mut effect, dst, size, result)?;
            }
        }
        m @ (Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Test) => {
            let size = operand_size(inst);
            let (dst, src) = binary_operands(inst);
            let lhs = read_operand(state, dst, size)?;
            let rhs = read_operand(state, src, size)?;
            let result = match m {
                Mnemonic::Or => lhs | rhs,
                Mnemonic::Xor => lhs ^ rhs,
                _ => lhs & rhs,
            };
            // Logic ops clear CF and OF; AF is left clear as well
            let mut flags = state.flags();
            flags.remove(Flags::CF | Flags::OF | Flags::AF);
            set_szp(&mut flags, result, size);
            state.set_flags(flags);
            if m != Mnemonic::Test {
                write_operand(state, &mut effect, dst, size, result)?;
            }
        }
        m @ (Mnemonic::Inc | Mnemonic::Dec) => {
            let size = operand_size(inst);
            let dst = unary_operand(inst);
            let lhs = read_operand(state, dst, size)?;
            let (result, overflow, _, aux) = if m == Mnemonic::Inc {
                add_with_flags(lhs, 1, false, size)
            } else {
                sub_with_flags(lhs, 1, false, size)
            };
            // inc and dec leave CF alone
            let mut flags = state.flags();
            flags.set(Flags::OF, overflow);
            flags.set(Flags::AF, aux);
            set_szp(&mut flags, result, size);
            state.set_flags(flags);
            write_operand(state, &mut effect, dst, size, result)?;
        }
        Mnemonic::Neg => {
            let size = operand_size(inst);
            let dst = unary_operand(inst);
            let rhs = read_operand(state, dst, size)?;
            let (result, overflow, carry, aux) = sub_with_flags(0, rhs, false, size);
            apply_arith_flags(state, size, result, overflow, carry, aux);
            write_operand(state, &mut effect, dst, size, result)?;
        }
        Mnemonic::Not => {
            let size = operand_size(inst);
            let dst = unary_operand(inst);
            let val = read_operand(state, dst, size)?;
            write_operand(state, &mut effect, dst, size, !val)?;
        }
        Mnemonic::Xchg => {
            let size = operand_size(inst);
            let (dst, src) = binary_operands(inst);
            let dst_val = read_operand(state, dst, size)?;
            let src_val = read_operand(state, src, size)?;
            write_operand(state, &mut effect, dst, size, src_val)?;
            write_operand(state, &mut effect, src, size, dst_val)?;
        }
        Mnemonic::Lea => {
            let (dst, src) = binary_operands(inst);
            let offset = match src {
                Operand::Memory(mem) => effective_offset(state, mem),
                _ => return Err(unimplemented(inst)),
            };
            write_operand(state, &mut effect, dst, OpSize::Word, offset)?;
        }
        m @ (Mnemonic::Lds | Mnemonic::Les) => {
            let (dst, src) = binary_operands(inst);
            let mem = match src {
                Operand::Memory(mem) => mem,
                _ => return Err(unimplemented(inst)),
            };
            let addr = effective_address(state, mem);
            let offset = state.load_u16(addr);
            let segment = state.load_u16(addr + 2);
            write_operand(state, &mut effect, dst, OpSize::Word, offset)?;
            let sreg = if m == Mnemonic::Lds {
                SegReg::Ds
            } else {
                SegReg::Es
            };
            write_reg_traced(state, &mut effect, RegOperand::seg(sreg), segment);
        }
        Mnemonic::Lahf => {
            let low = state.flags().bits() as u8 as u16;
            write_reg_traced(state, &mut effect, RegOperand::byte(4), low);
        }
        Mnemonic::Sahf => {
            let ah = state.read_register(RegOperand::byte(4));
            let status = Flags::CF | Flags::PF | Flags::AF | Flags::ZF | Flags::SF;
            let mut flags = state.flags();
            flags.remove(status);
            flags.insert(Flags::from_bits_truncate(ah) & status);
            state.set_flags(flags);
        }
        Mnemonic::Cbw => {
            let al = state.read_register(RegOperand::byte(reg::AX));
            let val = (al as u8 as i8) as i16 as u16;
            write_reg_traced(state, &mut effect, RegOperand::word(reg::AX), val);
        }
        Mnemonic::Cwd => {
            let ax = state.reg(Reg::Ax);
            let val = if ax & 0x8000 != 0 { 0xFFFF } else { 0 };
            write_reg_traced(state, &mut effect, RegOperand::word(reg::DX), val);
        }
        Mnemonic::Xlat => {
            let table = state.reg(Reg::Bx);
            let al = state.read_register(RegOperand::byte(reg::AX));
            let addr = physical_address(state.reg(Reg::Ds), table.wrapping_add(al));
            let val = state.load_u8(addr) as u16;
            write_reg_traced(state, &mut effect, RegOperand::byte(reg::AX), val);
        }
        Mnemonic::Push => {
            let val = read_operand(state, unary_operand(inst), OpSize::Word)?;
            push_word(state, &mut effect, val);
        }
        Mnemonic::Pop => {
            let val = pop_word(state, &mut effect);
            write_operand(state, &mut effect, unary_operand(inst), OpSize::Word, val)?;
        }
        Mnemonic::Pushf => {
            let val = state.flags().bits();
            push_word(state, &mut effect, val);
        }
        Mnemonic::Popf => {
            let val = pop_word(state, &mut effect);
            state.set_flags(Flags::from_bits_truncate(val));
        }
        Mnemonic::Call => match inst.dest {
            Some(Operand::Label(disp)) => {
                let return_ip = state.reg(Reg::Ip);
                push_word(state, &mut effect, return_ip);
                jump_relative(state, disp);
            }
            Some(Operand::FarPointer { cs, ip }) => {
                let (return_cs, return_ip) = (state.reg(Reg::Cs), state.reg(Reg::Ip));
                push_word(state, &mut effect, return_cs);
                push_word(state, &mut effect, return_ip);
                write_reg_traced(state, &mut effect, RegOperand::seg(SegReg::Cs), cs);
                state.set_reg(Reg::Ip, ip);
            }
            Some(Operand::Register(_) | Operand::Memory(_)) if !inst.far => {
                let target = read_operand(state, unary_operand(inst), OpSize::Word)?;
                let return_ip = state.reg(Reg::Ip);
                push_word(state, &mut effect, return_ip);
                state.set_reg(Reg::Ip, target);
            }
            _ => return Err(unimplemented(inst)),
        },
        Mnemonic::Ret => {
            let target = pop_word(state, &mut effect);
            state.set_reg(Reg::Ip, target);
            if let Some(Operand::Immediate(imm)) = inst.dest {
                let sp = state.reg(Reg::Sp).wrapping_add(imm.value as u16);
                write_reg_traced(state, &mut effect, RegOperand::word(reg::SP), sp);
            }
        }
        Mnemonic::Jmp => match inst.dest {
            Some(Operand::Label(disp)) => jump_relative(state, disp),
            Some(Operand::FarPointer { cs, ip }) => {
                write_reg_traced(state, &mut effect, RegOperand::seg(SegReg::Cs), cs);
                state.set_reg(Reg::Ip, ip);
            }
            Some(Operand::Register(_) | Operand::Memory(_)) if !inst.far => {
                let target = read_operand(state, unary_operand(inst), OpSize::Word)?;
                state.set_reg(Reg::Ip, target);
            }
            _ => return Err(unimplemented(inst)),
        },
        m @ (Mnemonic::Je
        | Mnemonic::Jne
        | Mnemonic::Jb
        | Mnemonic::Jnb
        | Mnemonic::Jbe
        | Mnemonic::Ja
        | Mnemonic::Jl
        | Mnemonic::Jnl
        | Mnemonic::Jle
        | Mnemonic::Jg
        | Mnemonic::Jp
        | Mnemonic::Jnp
        | Mnemonic::Jo
        | Mnemonic::Jno
        | Mnemonic::Js
        | Mnemonic::Jns) => {
            let flags = state.flags();
            let zf = flags.contains(Flags::ZF);
            let cf = flags.contains(Flags::CF);
            let sf = flags.contains(Flags::SF);
            let of = flags.contains(Flags::OF);
            let pf = flags.contains(Flags::PF);
            // Table 2-15 of the manual
            let taken = match m {
                Mnemonic::Je => zf,
                Mnemonic::Jne => !zf,
                Mnemonic::Jb => cf,
                Mnemonic::Jnb => !cf,
                Mnemonic::Jbe => cf || zf,
                Mnemonic::Ja => !cf && !zf,
                Mnemonic::Jl => sf != of,
                Mnemonic::Jnl => sf == of,
                Mnemonic::Jle => (sf != of) || zf,
                Mnemonic::Jg => !((sf != of) || zf),
                Mnemonic::Jp => pf,
                Mnemonic::Jnp => !pf,
                Mnemonic::Jo => of,
                Mnemonic::Jno => !of,
                Mnemonic::Js => sf,
                _ => !sf,
            };
            if taken {
                jump_label(state, inst);
            }
        }
        m @ (Mnemonic::Loop | Mnemonic::Loopz | Mnemonic::Loopnz) => {
            let cx = state.reg(Reg::Cx).wrapping_sub(1);
            write_reg_traced(state, &mut effect, RegOperand::word(reg::CX), cx);
            let zf = state.flags().contains(Flags::ZF);
            let taken = cx != 0
                && match m {
                    Mnemonic::Loopz => zf,
                    Mnemonic::Loopnz => !zf,
                    _ => true,
                };
            if taken {
                jump_label(state, inst);
            }
        }
        Mnemonic::Jcxz => {
            if state.reg(Reg::Cx) == 0 {
                jump_label(state, inst);
            }
        }
        m @ (Mnemonic::Movs | Mnemonic::Cmps | Mnemonic::Scas | Mnemonic::Lods
        | Mnemonic::Stos) => {
            string_op(m, inst, state, &mut effect);
        }
        Mnemonic::Clc => {
            let mut flags = state.flags();
            flags.remove(Flags::CF);
            state.set_flags(flags);
        }
        Mnemonic::Cmc => {
            let mut flags = state.flags();
            flags.toggle(Flags::CF);
            state.set_flags(flags);
        }
        Mnemonic::Stc => {
            let mut flags = state.flags();
            flags.insert(Flags::CF);
            state.set_flags(flags);
        }
        Mnemonic::Cld => {
            let mut flags = state.flags();
            flags.remove(Flags::DF);
            state.set_flags(flags);
        }
        Mnemonic::Std => {
            let mut flags = state.flags();
            flags.insert(Flags::DF);
            state.set_flags(flags);
        }
        Mnemonic::Cli => {
            let mut flags = state.flags();
            flags.remove(Flags::IF);
            state.set_flags(flags);
        }
        Mnemonic::Sti => {
            let mut flags = state.flags();
            flags.insert(Flags::IF);
            state.set_flags(flags);
        }
        // The run loop stops once a halt retires
        Mnemonic::Hlt => {}
        _ => return Err(unimplemented(inst)),
    }

    effect.push_str(&format!(" ip:0x{:x}->0x{:x}", old_ip, state.reg(Reg::Ip)));

    let new_flags = state.flags();
    if new_flags != old_flags {
        effect.push_str(&format!(
            " flags:{}->{}",
            flag_letters(old_flags),
            flag_letters(new_flags)
        ));
    }

    Ok(effect)
}

fn unimplemented(inst: &Instruction) -> ExecError {
    ExecError::Unimplemented {
        mnemonic: inst.mnemonic.to_string(),
    }
}

/// Both operands of a two-operand instruction. The decoder guarantees they
/// exist for every mnemonic dispatched through here.
fn binary_operands(inst: &Instruction) -> (&Operand, &Operand) {
    match (&inst.dest, &inst.source) {
        (Some(dst), Some(src)) => (dst, src),
        _ => unreachable!("`{}` decoded without two operands", inst.mnemonic),
    }
}

fn unary_operand(inst: &Instruction) -> &Operand {
    match &inst.dest {
        Some(dst) => dst,
        None => unreachable!("`{}` decoded without an operand", inst.mnemonic),
    }
}

/// The operand width of an instruction: a register operand pins it, then an
/// explicit memory size, then the string-op suffix, then word.
fn operand_size(inst: &Instruction) -> OpSize {
    for op in [&inst.dest, &inst.source].into_iter().flatten() {
        if let Operand::Register(r) = op {
            return r.size;
        }
    }
    for op in [&inst.dest, &inst.source].into_iter().flatten() {
        if let Operand::Memory(mem) = op {
            if let Some(size) = mem.size {
                return size;
            }
        }
    }
    inst.size.unwrap_or(OpSize::Word)
}

/// The offset half of a memory operand's effective address: the base
/// formula's register sum plus the displacement.
fn effective_offset(state: &CpuState, mem: &MemOperand) -> u16 {
    if mem.direct {
        return mem.disp as u16;
    }
    let base = match mem.formula & 0b111 {
        0b000 => state.reg(Reg::Bx).wrapping_add(state.reg(Reg::Si)),
        0b001 => state.reg(Reg::Bx).wrapping_add(state.reg(Reg::Di)),
        0b010 => state.reg(Reg::Bp).wrapping_add(state.reg(Reg::Si)),
        0b011 => state.reg(Reg::Bp).wrapping_add(state.reg(Reg::Di)),
        0b100 => state.reg(Reg::Si),
        0b101 => state.reg(Reg::Di),
        0b110 => state.reg(Reg::Bp),
        _ => state.reg(Reg::Bx),
    };
    base.wrapping_add(mem.disp as u16)
}

/// The physical address of a memory operand: the override segment if one
/// was given, otherwise SS when the base formula involves BP, otherwise DS.
fn effective_address(state: &CpuState, mem: &MemOperand) -> usize {
    let segment = match mem.segment {
        Some(SegReg::Es) => state.reg(Reg::Es),
        Some(SegReg::Cs) => state.reg(Reg::Cs),
        Some(SegReg::Ss) => state.reg(Reg::Ss),
        Some(SegReg::Ds) => state.reg(Reg::Ds),
        None if !mem.direct && matches!(mem.formula & 0b111, 0b010 | 0b011 | 0b110) => {
            state.reg(Reg::Ss)
        }
        None => state.reg(Reg::Ds),
    };
    physical_address(segment, effective_offset(state, mem))
}

/// Read the value of a register, immediate, or memory operand.
fn read_operand(state: &CpuState, op: &Operand, size: OpSize) -> Result<u16, ExecError> {
    Ok(match op {
        Operand::Register(r) => state.read_register(*r),
        Operand::Immediate(imm) => imm.value as u16,
        Operand::Memory(mem) => {
            let addr = effective_address(state, mem);
            match size {
                OpSize::Byte => state.load_u8(addr) as u16,
                OpSize::Word => state.load_u16(addr),
            }
        }
        Operand::Label(_) | Operand::FarPointer { .. } => {
            unreachable!("jump targets are not value operands")
        }
    })
}

/// Write a value to a register or memory operand, tracing register changes.
fn write_operand(
    state: &mut CpuState,
    effect: &mut String,
    op: &Operand,
    size: OpSize,
    val: u16,
) -> Result<(), ExecError> {
    match op {
        Operand::Register(r) => write_reg_traced(state, effect, *r, val),
        Operand::Memory(mem) => {
            let addr = effective_address(state, mem);
            match size {
                OpSize::Byte => state.store_u8(addr, val as u8),
                OpSize::Word => state.store_u16(addr, val),
            }
        }
        _ => unreachable!("jump targets are not value operands"),
    }
    Ok(())
}

/// Write a register and append a ` reg:0xold->0xnew` trace if it changed.
fn write_reg_traced(state: &mut CpuState, effect: &mut String, reg_op: RegOperand, val: u16) {
    let (old, new) = state.write_register(reg_op, val);
    if old != new {
        effect.push_str(&format!(
            " {}:0x{:x}->0x{:x}",
            CpuState::wide_name(reg_op),
            old,
            new
        ));
    }
}

fn push_word(state: &mut CpuState, effect: &mut String, val: u16) {
    let sp = state.reg(Reg::Sp).wrapping_sub(2);
    write_reg_traced(state, effect, RegOperand::word(reg::SP), sp);
    let addr = physical_address(state.reg(Reg::Ss), sp);
    state.store_u16(addr, val);
}

fn pop_word(state: &mut CpuState, effect: &mut String) -> u16 {
    let sp = state.reg(Reg::Sp);
    let val = state.load_u16(physical_address(state.reg(Reg::Ss), sp));
    write_reg_traced(state, effect, RegOperand::word(reg::SP), sp.wrapping_add(2));
    val
}

fn jump_relative(state: &mut CpuState, disp: i16) {
    let ip = state.reg(Reg::Ip).wrapping_add(disp as u16);
    state.set_reg(Reg::Ip, ip);
}

fn jump_label(state: &mut CpuState, inst: &Instruction) {
    match inst.dest {
        Some(Operand::Label(disp)) => jump_relative(state, disp),
        _ => unreachable!("`{}` decoded without a jump target", inst.mnemonic),
    }
}

/// One pass (or a REP run) of a string instruction, always DS:SI to ES:DI.
/// SI and DI step by the operand width, backwards when DF is set. Repeated
/// CMPS/SCAS stop at the first mismatch.
fn string_op(m: Mnemonic, inst: &Instruction, state: &mut CpuState, effect: &mut String) {
    let size = inst.size.unwrap_or(OpSize::Word);
    let step = size.bytes();

    let old_ax = state.reg(Reg::Ax);
    let old_si = state.reg(Reg::Si);
    let old_di = state.reg(Reg::Di);
    let old_cx = state.reg(Reg::Cx);

    let accumulator = RegOperand::sized(size, reg::AX);

    loop {
        if inst.rep && state.reg(Reg::Cx) == 0 {
            break;
        }

        let delta = if state.flags().contains(Flags::DF) {
            step.wrapping_neg()
        } else {
            step
        };
        let si = state.reg(Reg::Si);
        let di = state.reg(Reg::Di);
        let src_addr = physical_address(state.reg(Reg::Ds), si);
        let dst_addr = physical_address(state.reg(Reg::Es), di);

        match m {
            Mnemonic::Movs => {
                match size {
                    OpSize::Byte => {
                        let val = state.load_u8(src_addr);
                        state.store_u8(dst_addr, val);
                    }
                    OpSize::Word => {
                        let val = state.load_u16(src_addr);
                        state.store_u16(dst_addr, val);
                    }
                }
                state.set_reg(Reg::Si, si.wrapping_add(delta));
                state.set_reg(Reg::Di, di.wrapping_add(delta));
            }
            Mnemonic::Stos => {
                let val = state.read_register(accumulator);
                match size {
                    OpSize::Byte => state.store_u8(dst_addr, val as u8),
                    OpSize::Word => state.store_u16(dst_addr, val),
                }
                state.set_reg(Reg::Di, di.wrapping_add(delta));
            }
            Mnemonic::Lods => {
                let val = match size {
                    OpSize::Byte => state.load_u8(src_addr) as u16,
                    OpSize::Word => state.load_u16(src_addr),
                };
                state.write_register(accumulator, val);
                state.set_reg(Reg::Si, si.wrapping_add(delta));
            }
            Mnemonic::Scas => {
                let rhs = match size {
                    OpSize::Byte => state.load_u8(dst_addr) as u16,
                    OpSize::Word => state.load_u16(dst_addr),
                };
                let lhs = state.read_register(accumulator);
                compare(state, lhs, rhs, size);
                state.set_reg(Reg::Di, di.wrapping_add(delta));
            }
            Mnemonic::Cmps => {
                let (lhs, rhs) = match size {
                    OpSize::Byte => (state.load_u8(src_addr) as u16, state.load_u8(dst_addr) as u16),
                    OpSize::Word => (state.load_u16(src_addr), state.load_u16(dst_addr)),
                };
                compare(state, lhs, rhs, size);
                state.set_reg(Reg::Si, si.wrapping_add(delta));
                state.set_reg(Reg::Di, di.wrapping_add(delta));
            }
            _ => unreachable!(),
        }

        if !inst.rep {
            break;
        }
        let cx = state.reg(Reg::Cx).wrapping_sub(1);
        state.set_reg(Reg::Cx, cx);
        if matches!(m, Mnemonic::Cmps | Mnemonic::Scas) && !state.flags().contains(Flags::ZF) {
            break;
        }
    }

    // One trace per touched register, against the values on entry
    for (r, name, old) in [
        (Reg::Ax, "ax", old_ax),
        (Reg::Si, "si", old_si),
        (Reg::Di, "di", old_di),
        (Reg::Cx, "cx", old_cx),
    ] {
        let new = state.reg(r);
        if new != old {
            effect.push_str(&format!(" {name}:0x{old:x}->0x{new:x}"));
        }
    }
}

/// CMP-style flag update without a writeback.
fn compare(state: &mut CpuState, lhs: u16, rhs: u16, size: OpSize) {
    let (result, overflow, carry, aux) = sub_with_flags(lhs, rhs, false, size);
    apply_arith_flags(state, size, result, overflow, carry, aux);
}

fn apply_arith_flags(
    state: &mut CpuState,
    size: OpSize,
    result: u16,
    overflow: bool,
    carry: bool,
    aux: bool,
) {
    let mut flags = state.flags();
    flags.set(Flags::CF, carry);
    flags.set(Flags::OF, overflow);
    flags.set(Flags::AF, aux);
    set_szp(&mut flags, result, size);
    state.set_flags(flags);
}

fn width_masks(size: OpSize) -> (u32, u32) {
    match size {
        OpSize::Byte => (0x00FF, 0x0080),
        OpSize::Word => (0xFFFF, 0x8000),
    }
}

/// SF, ZF, and PF from a result at the given width. Parity only ever looks
/// at the low eight bits.
fn set_szp(flags: &mut Flags, result: u16, size: OpSize) {
    let (mask, sign_bit) = width_masks(size);
    let result = result as u32 & mask;
    flags.set(Flags::ZF, result == 0);
    flags.set(Flags::SF, result & sign_bit != 0);
    flags.set(Flags::PF, (result & 0xFF).count_ones() % 2 == 0);
}

/// Add at the given width, with an optional carry-in. Returns the masked
/// result, signed overflow, the carry out of the top bit, and the carry out
/// of the low nibble.
///
/// Overflow cannot occur when the operands' sign bits differ; when they
/// match, it occurs iff the result's sign bit differs from theirs.
fn add_with_flags(lhs: u16, rhs: u16, carry_in: bool, size: OpSize) -> (u16, bool, bool, bool) {
    let (mask, sign_bit) = width_masks(size);
    let a = lhs as u32 & mask;
    let b = rhs as u32 & mask;
    let sum = a + b + carry_in as u32;
    let result = sum & mask;
    let carry = sum > mask;
    let overflow = (a ^ result) & (b ^ result) & sign_bit != 0;
    let aux = (a ^ b ^ sum) & 0x10 != 0;
    (result as u16, overflow, carry, aux)
}

/// Subtract rhs (plus an optional borrow-in) from lhs at the given width.
/// The carry flag reports an unsigned borrow; the auxiliary flag reports a
/// borrow into the low nibble.
fn sub_with_flags(lhs: u16, rhs: u16, borrow_in: bool, size: OpSize) -> (u16, bool, bool, bool) {
    let (mask, sign_bit) = width_masks(size);
    let a = lhs as u32 & mask;
    let b = rhs as u32 & mask;
    let taken = b + borrow_in as u32;
    let result = a.wrapping_sub(taken) & mask;
    let carry = taken > a;
    // Subtraction overflows iff the operand signs differ and the result's
    // sign no longer matches the left side's
    let overflow = (a ^ b) & (a ^ result) & sign_bit != 0;
    let aux = (b & 0xF) + borrow_in as u32 > (a & 0xF);
    (result as u16, overflow, carry, aux)
}

/// The final-state block printed after a run: every nonzero register, the
/// IP, and the flags if any are set.
pub fn print_final_state(state: &CpuState) -> Vec<String> {
    let mut lines = vec![];
    lines.push(String::new());
    lines.push("Final registers:".to_string());
    for (r, name) in [
        (Reg::Ax, "ax"),
        (Reg::Bx, "bx"),
        (Reg::Cx, "cx"),
        (Reg::Dx, "dx"),
        (Reg::Sp, "sp"),
        (Reg::Bp, "bp"),
        (Reg::Si, "si"),
        (Reg::Di, "di"),
        (Reg::Es, "es"),
        (Reg::Cs, "cs"),
        (Reg::Ss, "ss"),
        (Reg::Ds, "ds"),
    ] {
        let val = state.reg(r);
        if val != 0 {
            lines.push(format!("      {}: 0x{:04x} ({})", name, val, val));
        }
    }
    let ip = state.reg(Reg::Ip);
    lines.push(format!("      ip: 0x{:04x} ({})", ip, ip));
    let flags = state.flags();
    if !flags.is_empty() {
        lines.push(format!("   flags: {}", flag_letters(flags)));
    }
    lines.push(String::new());
    lines
}

/// Write the whole memory buffer to a file, raw.
pub fn memory_to_file(memory: &[u8], output_file: &str) -> std::io::Result<()> {
    let mut file = File::create(output_file)?;
    file.write_all(memory)?;
    file.flush()
}
