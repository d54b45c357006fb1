//! This module implements the 8086 decoding logic: prefix consumption, first
//! byte classification, the mod r/m byte, and displacement/immediate bytes,
//! producing structured [`Instruction`] values.
//!
//! The encoding is bit-sliced and irregular, and this file is hard to follow
//! without the opcode tables from the 8086 manual (pages 4-18 through 4-36)
//! at hand. The layout here mirrors those tables: one match arm per row,
//! with the sub-opcode groups (the "mod □ r/m" column of table 4-14) broken
//! out into small helper functions:
//!
//! ```text
//! | mod □ rm | 000 | 001 | 010 | 011 | 100 | 101 | 110 | 111 |
//! |----------+-----+-----+-----+-----+-----+-----+-----+-----+
//! | Immed    | ADD | OR  | ADC | SBB | AND | SUB | XOR | CMP |
//! | Shift    | ROL | ROR | RCL | RCR |SHL/SAL|SHR|-----| SAR |
//! | Grp 1    |TEST |-----| NOT | NEG | MUL |IMUL | DIV |IDIV |
//! | Grp 2    | INC | DEC |CALL |CALL | JMP | JMP | PUSH|-----|
//! ```
//!
//! The blank cells are reserved by the ISA and decode to `IllegalSubOp`.

use thiserror::Error;

use crate::inst::{
    reg, ImmOperand, Instruction, MemOperand, Mnemonic, OpSize, Operand, RegOperand, SegReg,
};
use crate::stream::ByteStream;

/// The r/m value that selects a direct 16-bit address under mod 00.
const DIRECT_ADDR: u8 = 0b110;

/// Decode-time settings.
#[derive(Default)]
pub struct DecodeSettings {
    /// Print each opcode byte as it is classified.
    pub verbose: bool,
}

/// The ways a byte stream can fail to decode. All are fatal to the current
/// run. Offending bytes print in binary, the way the opcode tables show
/// them.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("instruction stream ended while reading {context}")]
    ShortRead { context: &'static str },
    #[error("unknown opcode 0b{byte:08b}")]
    UnknownOpcode { byte: u8 },
    #[error("illegal sub-opcode 0b{sub_op:03b} in mod r/m byte 0b{byte:08b}")]
    IllegalSubOp { byte: u8, sub_op: u8 },
    #[error("illegal segment register selector in mod r/m byte 0b{byte:08b}")]
    IllegalSegmentSelector { byte: u8 },
    #[error("byte following 0b{byte:08b} must be 0b00001010, found 0b{second:08b}")]
    IllegalSecondByte { byte: u8, second: u8 },
}

/// Decode a whole stream front to back, with no regard for control flow.
/// Returns every instruction decoded before the end of the stream or the
/// first error.
pub fn decode(
    program: &[u8],
    settings: &DecodeSettings,
) -> (Vec<Instruction>, Option<DecodeError>) {
    let mut stream = ByteStream::new(program);
    let mut insts = vec![];
    while stream.has_bytes() {
        match decode_single(&mut stream, settings) {
            Ok(inst) => insts.push(inst),
            Err(e) => return (insts, Some(e)),
        }
    }
    (insts, None)
}

/// The decoded fields of a mod r/m byte, with any displacement it implies
/// already consumed from the stream.
struct ModRm {
    /// The raw byte, kept for diagnostics.
    byte: u8,
    /// The middle three bits: a register number or a sub-opcode.
    reg: u8,
    /// The r/m operand: a register under mod 11, a memory operand otherwise.
    operand: Operand,
}

/// Read the mod r/m byte and any displacement. `size` is the width used when
/// r/m names a register; `segment` is the active override prefix, attached
/// to memory operands only.
fn read_mod_rm(
    stream: &mut ByteStream,
    size: OpSize,
    segment: Option<SegReg>,
) -> Result<ModRm, DecodeError> {
    let byte = stream.read_u8("mod r/m byte")?;
    let mode = byte >> 6;
    let reg = (byte >> 3) & 0b111;
    let rm = byte & 0b111;

    let memory = |disp: i16, direct: bool| {
        Operand::Memory(MemOperand {
            size: None,
            formula: rm,
            disp,
            direct,
            segment,
            explicit_size: false,
        })
    };

    let operand = match mode {
        0b00 if rm == DIRECT_ADDR => memory(stream.read_i16("direct address")?, true),
        0b00 => memory(0, false),
        // 8-bit displacements are signed and extend to 16 bits
        0b01 => memory(stream.read_i8("8-bit displacement")? as i16, false),
        0b10 => memory(stream.read_i16("16-bit displacement")?, false),
        _ => Operand::Register(RegOperand::sized(size, rm)),
    };

    Ok(ModRm { byte, reg, operand })
}

/// The W bit of the first byte: word when set, byte otherwise.
fn w_size(byte: u8) -> OpSize {
    if byte & 0b1 != 0 {
        OpSize::Word
    } else {
        OpSize::Byte
    }
}

/// Read the mod r/m byte and pair its operand with the REG-field register.
/// The D bit decides direction: when set, REG is the destination.
fn rm_reg_operands(
    stream: &mut ByteStream,
    byte: u8,
    segment: Option<SegReg>,
) -> Result<(Operand, Operand), DecodeError> {
    let size = w_size(byte);
    let mod_rm = read_mod_rm(stream, size, segment)?;
    let reg_op = Operand::Register(RegOperand::sized(size, mod_rm.reg));
    Ok(if byte & 0b10 != 0 {
        (reg_op, mod_rm.operand)
    } else {
        (mod_rm.operand, reg_op)
    })
}

/// Stamp a size marker onto a memory operand. Used for the immediate forms
/// and the single-operand groups, where no register operand pins the width.
fn mark_memory_size(operand: &mut Operand, size: OpSize) {
    if let Operand::Memory(mem) = operand {
        mem.size = Some(size);
        mem.explicit_size = true;
    }
}

/// The eight-entry arithmetic/logic family, selected either by bits 5..3 of
/// the first byte or by the sub-opcode of the 0x80..0x83 immediate group.
fn alu_mnemonic(bits: u8) -> Mnemonic {
    match bits & 0b111 {
        0b000 => Mnemonic::Add,
        0b001 => Mnemonic::Or,
        0b010 => Mnemonic::Adc,
        0b011 => Mnemonic::Sbb,
        0b100 => Mnemonic::And,
        0b101 => Mnemonic::Sub,
        0b110 => Mnemonic::Xor,
        _ => Mnemonic::Cmp,
    }
}

/// The shift/rotate family selected by the sub-opcode of 0xD0..0xD3.
fn shift_mnemonic(mod_rm_byte: u8, sub_op: u8) -> Result<Mnemonic, DecodeError> {
    Ok(match sub_op {
        0b000 => Mnemonic::Rol,
        0b001 => Mnemonic::Ror,
        0b010 => Mnemonic::Rcl,
        0b011 => Mnemonic::Rcr,
        0b100 => Mnemonic::Shl,
        0b101 => Mnemonic::Shr,
        0b111 => Mnemonic::Sar,
        _ => {
            return Err(DecodeError::IllegalSubOp {
                byte: mod_rm_byte,
                sub_op,
            })
        }
    })
}

/// Read a W-sized immediate; byte immediates are sign-extended to 16 bits.
fn read_imm(
    stream: &mut ByteStream,
    size: OpSize,
    context: &'static str,
) -> Result<Operand, DecodeError> {
    let value = match size {
        OpSize::Byte => stream.read_i8(context)? as i16,
        OpSize::Word => stream.read_i16(context)?,
    };
    Ok(Operand::Immediate(ImmOperand { size, value }))
}

fn accumulator(size: OpSize) -> Operand {
    Operand::Register(RegOperand::sized(size, reg::AX))
}

/// Print the hex and binary of a byte, as an assembly comment.
fn debug_byte(byte: u8) {
    println!("; byte 0x{byte:02X} (0b{byte:08b})");
}

/// Decode a single instruction starting at the stream's current position.
///
/// Prefix bytes (LOCK, segment override, REP) are consumed in a loop first;
/// their state lives only until the instruction is built. The first
/// non-prefix byte then selects a form, which determines every remaining
/// byte: an optional mod r/m byte, 0/1/2 displacement bytes, and 0/1/2
/// immediate bytes.
///
/// Decoding is a pure function of the slice and position: the same inputs
/// always yield the same instruction, and a second call picks up where the
/// previous one left off.
pub fn decode_single(
    stream: &mut ByteStream,
    settings: &DecodeSettings,
) -> Result<Instruction, DecodeError> {
    let addr = stream.pos();

    let mut lock = false;
    let mut rep = false;
    let mut segment: Option<SegReg> = None;

    let mut byte = stream.read_u8("opcode")?;
    loop {
        match byte {
            // lock
            0xF0 => lock = true,
            // rep/repne - the Z bit is not modeled
            0xF2 | 0xF3 => rep = true,
            // segment override - es: cs: ss: ds:
            0x26 | 0x2E | 0x36 | 0x3E => {
                segment = Some(SegReg::from_sr_field((byte >> 3) & 0b11))
            }
            _ => break,
        }
        if settings.verbose {
            debug_byte(byte);
        }
        byte = stream.read_u8("opcode after a prefix")?;
    }
    if settings.verbose {
        debug_byte(byte);
    }

    let mut mnemonic = None;
    let mut dest: Option<Operand> = None;
    let mut source: Option<Operand> = None;
    let mut size: Option<OpSize> = None;
    let mut far = false;

    match byte {
        // add/or/adc/sbb/and/sub/xor/cmp - reg/memory with register to either
        0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B | 0x20..=0x23 | 0x28..=0x2B
        | 0x30..=0x33 | 0x38..=0x3B => {
            mnemonic = Some(alu_mnemonic(byte >> 3));
            let (d, s) = rm_reg_operands(stream, byte, segment)?;
            dest = Some(d);
            source = Some(s);
        }
        // add/or/adc/sbb/and/sub/xor/cmp - immediate to/with accumulator
        0x04..=0x05 | 0x0C..=0x0D | 0x14..=0x15 | 0x1C..=0x1D | 0x24..=0x25 | 0x2C..=0x2D
        | 0x34..=0x35 | 0x3C..=0x3D => {
            mnemonic = Some(alu_mnemonic(byte >> 3));
            let w = w_size(byte);
            dest = Some(accumulator(w));
            source = Some(read_imm(stream, w, "immediate data")?);
        }
        // add/or/adc/sbb/and/sub/xor/cmp - immediate to register/memory. The
        // operation is picked by the sub-opcode; the S bit controls sign
        // extension of a single data byte.
        0x80..=0x83 => {
            let w = w_size(byte);
            let sign_extend = byte & 0b10 != 0;
            let mod_rm = read_mod_rm(stream, w, segment)?;
            mnemonic = Some(alu_mnemonic(mod_rm.reg));
            let mut rm = mod_rm.operand;
            mark_memory_size(&mut rm, w);
            dest = Some(rm);
            source = Some(match (sign_extend, w) {
                (false, OpSize::Word) => read_imm(stream, OpSize::Word, "immediate data")?,
                // One signed data byte, extended to the operand width
                (true, _) => Operand::Immediate(ImmOperand {
                    size: w,
                    value: stream.read_i8("immediate data")? as i16,
                }),
                // An unsigned data byte
                (false, OpSize::Byte) => Operand::Immediate(ImmOperand {
                    size: w,
                    value: stream.read_u8("immediate data")? as i16,
                }),
            });
        }
        // mov - register/memory to/from register
        0x88..=0x8B => {
            mnemonic = Some(Mnemonic::Mov);
            let (d, s) = rm_reg_operands(stream, byte, segment)?;
            dest = Some(d);
            source = Some(s);
        }
        // mov - immediate to register/memory
        0xC6..=0xC7 => {
            mnemonic = Some(Mnemonic::Mov);
            let w = w_size(byte);
            let mod_rm = read_mod_rm(stream, w, segment)?;
            let mut rm = mod_rm.operand;
            mark_memory_size(&mut rm, w);
            dest = Some(rm);
            source = Some(read_imm(stream, w, "immediate data")?);
        }
        // mov - immediate to register; the W bit sits at bit 3 here
        0xB0..=0xBF => {
            mnemonic = Some(Mnemonic::Mov);
            let w = w_size(byte >> 3);
            dest = Some(Operand::Register(RegOperand::sized(w, byte & 0b111)));
            source = Some(read_imm(stream, w, "immediate data")?);
        }
        // mov - memory to accumulator, or accumulator to memory
        0xA0..=0xA3 => {
            mnemonic = Some(Mnemonic::Mov);
            let w = w_size(byte);
            let mem = Operand::Memory(MemOperand {
                size: None,
                formula: 0,
                disp: stream.read_i16("direct address")?,
                direct: true,
                segment,
                explicit_size: false,
            });
            if byte & 0b10 != 0 {
                dest = Some(mem);
                source = Some(accumulator(w));
            } else {
                dest = Some(accumulator(w));
                source = Some(mem);
            }
        }
        // mov - register/memory to/from segment register. The selector field
        // is two bits wide; a set third bit is reserved.
        0x8C | 0x8E => {
            mnemonic = Some(Mnemonic::Mov);
            let mod_rm = read_mod_rm(stream, OpSize::Word, segment)?;
            if mod_rm.reg > 0b011 {
                return Err(DecodeError::IllegalSegmentSelector { byte: mod_rm.byte });
            }
            let sreg = Operand::Register(RegOperand::seg(SegReg::from_sr_field(mod_rm.reg)));
            if byte & 0b10 != 0 {
                dest = Some(sreg);
                source = Some(mod_rm.operand);
            } else {
                dest = Some(mod_rm.operand);
                source = Some(sreg);
            }
        }
        // inc/dec/call/jmp/push - register/memory. 0xFE only encodes inc and
        // dec; the rest of the column needs the W bit set.
        0xFE..=0xFF => {
            let w = w_size(byte);
            let mod_rm = read_mod_rm(stream, w, segment)?;
            let mut rm = mod_rm.operand;
            match (byte, mod_rm.reg) {
                (_, 0b000) => {
                    mnemonic = Some(Mnemonic::Inc);
                    mark_memory_size(&mut rm, w);
                }
                (_, 0b001) => {
                    mnemonic = Some(Mnemonic::Dec);
                    mark_memory_size(&mut rm, w);
                }
                (0xFF, 0b010) => mnemonic = Some(Mnemonic::Call),
                (0xFF, 0b011) => {
                    mnemonic = Some(Mnemonic::Call);
                    far = true;
                }
                (0xFF, 0b100) => mnemonic = Some(Mnemonic::Jmp),
                (0xFF, 0b101) => {
                    mnemonic = Some(Mnemonic::Jmp);
                    far = true;
                }
                (0xFF, 0b110) => {
                    mnemonic = Some(Mnemonic::Push);
                    mark_memory_size(&mut rm, OpSize::Word);
                }
                (_, sub_op) => {
                    return Err(DecodeError::IllegalSubOp {
                        byte: mod_rm.byte,
                        sub_op,
                    })
                }
            }
            dest = Some(rm);
        }
        // pop - register/memory
        0x8F => {
            mnemonic = Some(Mnemonic::Pop);
            let mod_rm = read_mod_rm(stream, OpSize::Word, segment)?;
            let mut rm = mod_rm.operand;
            mark_memory_size(&mut rm, OpSize::Word);
            dest = Some(rm);
        }
        // push - register
        0x50..=0x57 => {
            mnemonic = Some(Mnemonic::Push);
            dest = Some(Operand::Register(RegOperand::word(byte & 0b111)));
        }
        // pop - register
        0x58..=0x5F => {
            mnemonic = Some(Mnemonic::Pop);
            dest = Some(Operand::Register(RegOperand::word(byte & 0b111)));
        }
        // push - segment register
        0x06 | 0x0E | 0x16 | 0x1E => {
            mnemonic = Some(Mnemonic::Push);
            dest = Some(Operand::Register(RegOperand::seg(SegReg::from_sr_field(
                byte >> 3,
            ))));
        }
        // pop - segment register. 0x0F (pop cs) executes on a real 8086 even
        // though later CPUs repurposed the byte.
        0x07 | 0x0F | 0x17 | 0x1F => {
            mnemonic = Some(Mnemonic::Pop);
            dest = Some(Operand::Register(RegOperand::seg(SegReg::from_sr_field(
                byte >> 3,
            ))));
        }
        // xchg - register/memory with register
        0x86..=0x87 => {
            mnemonic = Some(Mnemonic::Xchg);
            let (d, s) = rm_reg_operands(stream, byte, segment)?;
            dest = Some(d);
            source = Some(s);
        }
        // xchg - register with accumulator
        0x90..=0x97 => {
            mnemonic = Some(Mnemonic::Xchg);
            dest = Some(accumulator(OpSize::Word));
            source = Some(Operand::Register(RegOperand::word(byte & 0b111)));
        }
        // in - fixed port
        0xE4..=0xE5 => {
            mnemonic = Some(Mnemonic::In);
            dest = Some(accumulator(w_size(byte)));
            source = Some(Operand::Immediate(ImmOperand {
                size: OpSize::Byte,
                value: stream.read_u8("port number")? as i16,
            }));
        }
        // in - variable port (dx)
        0xEC..=0xED => {
            mnemonic = Some(Mnemonic::In);
            dest = Some(accumulator(w_size(byte)));
            source = Some(Operand::Register(RegOperand::word(reg::DX)));
        }
        // out - fixed port
        0xE6..=0xE7 => {
            mnemonic = Some(Mnemonic::Out);
            dest = Some(Operand::Immediate(ImmOperand {
                size: OpSize::Byte,
                value: stream.read_u8("port number")? as i16,
            }));
            source = Some(accumulator(w_size(byte)));
        }
        // out - variable port (dx)
        0xEE..=0xEF => {
            mnemonic = Some(Mnemonic::Out);
            dest = Some(Operand::Register(RegOperand::word(reg::DX)));
            source = Some(accumulator(w_size(byte)));
        }
        // xlat - translate byte through the table at bx
        0xD7 => mnemonic = Some(Mnemonic::Xlat),
        // lea - load effective address to register. The register operand
        // already fixes the width, so the memory side gets no size marker.
        0x8D => {
            mnemonic = Some(Mnemonic::Lea);
            let mod_rm = read_mod_rm(stream, OpSize::Word, segment)?;
            dest = Some(Operand::Register(RegOperand::word(mod_rm.reg)));
            source = Some(mod_rm.operand);
        }
        // lds/les - load a 32-bit pointer into ds:reg or es:reg
        0xC4..=0xC5 => {
            mnemonic = Some(if byte & 0b1 != 0 {
                Mnemonic::Lds
            } else {
                Mnemonic::Les
            });
            let mod_rm = read_mod_rm(stream, OpSize::Word, segment)?;
            dest = Some(Operand::Register(RegOperand::word(mod_rm.reg)));
            source = Some(mod_rm.operand);
        }
        // pushf/popf/sahf/lahf
        0x9C => mnemonic = Some(Mnemonic::Pushf),
        0x9D => mnemonic = Some(Mnemonic::Popf),
        0x9E => mnemonic = Some(Mnemonic::Sahf),
        0x9F => mnemonic = Some(Mnemonic::Lahf),
        // inc - register
        0x40..=0x47 => {
            mnemonic = Some(Mnemonic::Inc);
            dest = Some(Operand::Register(RegOperand::word(byte & 0b111)));
        }
        // dec - register
        0x48..=0x4F => {
            mnemonic = Some(Mnemonic::Dec);
            dest = Some(Operand::Register(RegOperand::word(byte & 0b111)));
        }
        // daa/das/aaa/aas - decimal/ASCII adjusts
        0x27 => mnemonic = Some(Mnemonic::Daa),
        0x2F => mnemonic = Some(Mnemonic::Das),
        0x37 => mnemonic = Some(Mnemonic::Aaa),
        0x3F => mnemonic = Some(Mnemonic::Aas),
        // aam/aad - the second byte is a base operand that only ever
        // encodes ten
        0xD4..=0xD5 => {
            mnemonic = Some(if byte & 0b1 == 0 {
                Mnemonic::Aam
            } else {
                Mnemonic::Aad
            });
            let second = stream.read_u8("the second byte of aam/aad")?;
            if second != 0b00001010 {
                return Err(DecodeError::IllegalSecondByte { byte, second });
            }
        }
        // cbw/cwd - sign extensions into ax and dx:ax
        0x98 => mnemonic = Some(Mnemonic::Cbw),
        0x99 => mnemonic = Some(Mnemonic::Cwd),
        // test/not/neg/mul/imul/div/idiv - register/memory. Only test takes
        // an immediate.
        0xF6..=0xF7 => {
            let w = w_size(byte);
            let mod_rm = read_mod_rm(stream, w, segment)?;
            let mut rm = mod_rm.operand;
            mark_memory_size(&mut rm, w);
            mnemonic = Some(match mod_rm.reg {
                0b000 => {
                    source = Some(read_imm(stream, w, "immediate data")?);
                    Mnemonic::Test
                }
                0b010 => Mnemonic::Not,
                0b011 => Mnemonic::Neg,
                0b100 => Mnemonic::Mul,
                0b101 => Mnemonic::Imul,
                0b110 => Mnemonic::Div,
                0b111 => Mnemonic::Idiv,
                sub_op => {
                    return Err(DecodeError::IllegalSubOp {
                        byte: mod_rm.byte,
                        sub_op,
                    })
                }
            });
            dest = Some(rm);
        }
        // rol/ror/rcl/rcr/shl/shr/sar - by one, or by the count in cl when
        // the V bit is set
        0xD0..=0xD3 => {
            let w = w_size(byte);
            let mod_rm = read_mod_rm(stream, w, segment)?;
            mnemonic = Some(shift_mnemonic(mod_rm.byte, mod_rm.reg)?);
            let mut rm = mod_rm.operand;
            mark_memory_size(&mut rm, w);
            dest = Some(rm);
            source = Some(if byte & 0b10 != 0 {
                Operand::Register(RegOperand::byte(reg::CX))
            } else {
                Operand::Immediate(ImmOperand {
                    size: OpSize::Byte,
                    value: 1,
                })
            });
        }
        // test - register/memory and register
        0x84..=0x85 => {
            mnemonic = Some(Mnemonic::Test);
            let (d, s) = rm_reg_operands(stream, byte, segment)?;
            dest = Some(d);
            source = Some(s);
        }
        // test - immediate with accumulator
        0xA8..=0xA9 => {
            mnemonic = Some(Mnemonic::Test);
            let w = w_size(byte);
            dest = Some(accumulator(w));
            source = Some(read_imm(stream, w, "immediate data")?);
        }
        // movs/cmps/stos/lods/scas - string operations; the W bit becomes
        // the b/w mnemonic suffix
        0xA4..=0xA7 | 0xAA..=0xAF => {
            mnemonic = Some(match byte & 0b11111110 {
                0xA4 => Mnemonic::Movs,
                0xA6 => Mnemonic::Cmps,
                0xAA => Mnemonic::Stos,
                0xAC => Mnemonic::Lods,
                _ => Mnemonic::Scas,
            });
            size = Some(w_size(byte));
        }
        // call - direct within segment
        0xE8 => {
            mnemonic = Some(Mnemonic::Call);
            dest = Some(Operand::Label(stream.read_i16("call target")?));
        }
        // jmp - direct within segment
        0xE9 => {
            mnemonic = Some(Mnemonic::Jmp);
            dest = Some(Operand::Label(stream.read_i16("jump target")?));
        }
        // jmp - direct within segment, short
        0xEB => {
            mnemonic = Some(Mnemonic::Jmp);
            dest = Some(Operand::Label(stream.read_i8("jump target")? as i16));
        }
        // call/jmp - direct intersegment; the offset comes before the
        // segment
        0x9A | 0xEA => {
            mnemonic = Some(if byte == 0x9A {
                Mnemonic::Call
            } else {
                Mnemonic::Jmp
            });
            let ip = stream.read_u16("intersegment offset")?;
            let cs = stream.read_u16("intersegment segment")?;
            dest = Some(Operand::FarPointer { cs, ip });
        }
        // ret - within segment, optionally adding an immediate to sp
        0xC3 => mnemonic = Some(Mnemonic::Ret),
        0xC2 => {
            mnemonic = Some(Mnemonic::Ret);
            dest = Some(read_imm(stream, OpSize::Word, "stack adjustment")?);
        }
        // retf - intersegment
        0xCB => mnemonic = Some(Mnemonic::Retf),
        0xCA => {
            mnemonic = Some(Mnemonic::Retf);
            dest = Some(read_imm(stream, OpSize::Word, "stack adjustment")?);
        }
        // conditional jumps and loops - all take an 8-bit offset relative
        // to the end of the instruction
        0x70..=0x7F | 0xE0..=0xE3 => {
            mnemonic = Some(match byte {
                0x70 => Mnemonic::Jo,
                0x71 => Mnemonic::Jno,
                0x72 => Mnemonic::Jb,
                0x73 => Mnemonic::Jnb,
                0x74 => Mnemonic::Je,
                0x75 => Mnemonic::Jne,
                0x76 => Mnemonic::Jbe,
                0x77 => Mnemonic::Ja,
                0x78 => Mnemonic::Js,
                0x79 => Mnemonic::Jns,
                0x7A => Mnemonic::Jp,
                0x7B => Mnemonic::Jnp,
                0x7C => Mnemonic::Jl,
                0x7D => Mnemonic::Jnl,
                0x7E => Mnemonic::Jle,
                0x7F => Mnemonic::Jg,
                0xE0 => Mnemonic::Loopnz,
                0xE1 => Mnemonic::Loopz,
                0xE2 => Mnemonic::Loop,
                _ => Mnemonic::Jcxz,
            });
            dest = Some(Operand::Label(stream.read_i8("jump offset")? as i16));
        }
        // int/int3/into/iret
        0xCC => mnemonic = Some(Mnemonic::Int3),
        0xCD => {
            mnemonic = Some(Mnemonic::Int);
            dest = Some(Operand::Immediate(ImmOperand {
                size: OpSize::Byte,
                value: stream.read_u8("interrupt type")? as i16,
            }));
        }
        0xCE => mnemonic = Some(Mnemonic::Into),
        0xCF => mnemonic = Some(Mnemonic::Iret),
        // processor control - each has a byte of its own
        0xF4 => mnemonic = Some(Mnemonic::Hlt),
        0xF5 => mnemonic = Some(Mnemonic::Cmc),
        0xF8 => mnemonic = Some(Mnemonic::Clc),
        0xF9 => mnemonic = Some(Mnemonic::Stc),
        0xFA => mnemonic = Some(Mnemonic::Cli),
        0xFB => mnemonic = Some(Mnemonic::Sti),
        0xFC => mnemonic = Some(Mnemonic::Cld),
        0xFD => mnemonic = Some(Mnemonic::Std),
        0x9B => mnemonic = Some(Mnemonic::Wait),
        // esc - hand the operand to an external processor
        0xD8..=0xDF => {
            mnemonic = Some(Mnemonic::Esc);
            let mod_rm = read_mod_rm(stream, OpSize::Word, segment)?;
            dest = Some(mod_rm.operand);
        }
        _ => return Err(DecodeError::UnknownOpcode { byte }),
    }

    // A rep prefix only makes sense in front of a string operation
    if rep
        && !matches!(
            mnemonic,
            Some(
                Mnemonic::Movs
                    | Mnemonic::Cmps
                    | Mnemonic::Scas
                    | Mnemonic::Lods
                    | Mnemonic::Stos
            )
        )
    {
        return Err(DecodeError::UnknownOpcode { byte });
    }

    let mnemonic = match mnemonic {
        Some(m) => m,
        None => unreachable!("first byte 0b{byte:08b} classified without a mnemonic"),
    };

    Ok(Instruction {
        addr,
        mnemonic,
        dest,
        source,
        lock,
        rep,
        far,
        size,
        length: (stream.pos() - addr) as u16,
    })
}
