// Internal imports
use crate::decode::{decode, DecodeError, DecodeSettings};
use crate::execute::{
    execute, init_state, load_program, physical_address, print_final_state, CpuState, ExecError,
    ExecuteSettings, Flags, Reg, DEFAULT_STEP_LIMIT,
};
use crate::inst::{OpSize, RegOperand};
use crate::stream::ByteStream;

/// Decode a stream and compare every instruction against its expected text.
fn check_decode(inst_stream: Vec<u8>, expected_insts: Vec<&str>) {
    let settings = DecodeSettings::default();
    let (insts, error) = decode(&inst_stream, &settings);
    if let Some(e) = error {
        panic!("decode failed: {e}");
    }
    assert_eq!(insts.len(), expected_insts.len());
    for (inst, expected) in std::iter::zip(&insts, &expected_insts) {
        let actual = inst.to_string();
        if actual != *expected {
            println!("Expected inst: {expected}");
            println!("Actual   inst: {actual}");
            println!("{inst:#?}");
        }
        assert_eq!(actual, *expected);
    }
}

fn check_decode_error(inst_stream: Vec<u8>, expected: DecodeError) {
    let (_insts, error) = decode(&inst_stream, &DecodeSettings::default());
    assert_eq!(error, Some(expected));
}

/// Load a program at offset 0 and run it to completion.
fn run(program: &[u8]) -> (CpuState, Vec<String>) {
    let mut state = init_state();
    load_program(&mut state, program, 0);
    let (lines, error) = execute(&mut state, &ExecuteSettings::default());
    if let Some(e) = error {
        panic!("execution failed: {e}");
    }
    (state, lines)
}

#[test]
fn test_mov_reg_reg() {
    let inst_stream = vec![0x89, 0xD9, 0x88, 0xD9];
    let expected_insts = vec!["mov cx, bx", "mov cl, bl"];
    check_decode(inst_stream, expected_insts);
}

#[test]
fn test_mov_imm_reg() {
    check_decode(
        vec![0xB8, 0x01, 0x00, 0xB1, 0x0C, 0xB5, 0xF4],
        vec!["mov ax, 1", "mov cl, 12", "mov ch, -12"],
    );
}

#[test]
fn test_mov_imm_mem() {
    check_decode(
        vec![0xC6, 0x03, 0x07, 0xC7, 0x85, 0x85, 0x03, 0x5B, 0x01],
        vec!["mov byte [bp + di], 7", "mov word [di + 901], 347"],
    );
}

#[test]
fn test_mov_mem_displacements() {
    check_decode(
        vec![
            0x8B, 0x2E, 0x05, 0x00, // direct address
            0x8A, 0x60, 0x04, // positive 8-bit displacement
            0x8B, 0x41, 0xDB, // negative 8-bit displacement
            0x8A, 0x46, 0x00, // zero displacement is omitted
        ],
        vec![
            "mov bp, [5]",
            "mov ah, [bx + si + 4]",
            "mov ax, [bx + di - 37]",
            "mov al, [bp]",
        ],
    );
}

#[test]
fn test_mov_accumulator() {
    check_decode(
        vec![0xA1, 0xFB, 0x09, 0xA3, 0x0F, 0x00, 0xA0, 0x2A, 0x00],
        vec!["mov ax, [2555]", "mov [15], ax", "mov al, [42]"],
    );
}

#[test]
fn test_mov_segment_reg() {
    check_decode(
        vec![0x8E, 0xD8, 0x8C, 0xC0],
        vec!["mov ds, ax", "mov ax, es"],
    );
}

#[test]
fn test_illegal_segment_selector() {
    check_decode_error(
        vec![0x8E, 0xE0],
        DecodeError::IllegalSegmentSelector { byte: 0xE0 },
    );
}

#[test]
fn test_push_pop() {
    check_decode(
        vec![
            0x50, 0x5D, 0x06, 0x0F, 0xFF, 0x36, 0xB8, 0x0B, 0x8F, 0x06, 0x03, 0x00,
        ],
        vec![
            "push ax",
            "pop bp",
            "push es",
            "pop cs",
            "push word [3000]",
            "pop word [3]",
        ],
    );
}

#[test]
fn test_xchg() {
    check_decode(
        vec![0x87, 0x6C, 0x05, 0x93],
        vec!["xchg bp, [si + 5]", "xchg ax, bx"],
    );
}

#[test]
fn test_in_out() {
    check_decode(
        vec![0xE4, 0xC8, 0xEC, 0xE7, 0x2C, 0xEE],
        vec!["in al, 200", "in al, dx", "out 44, ax", "out dx, al"],
    );
}

#[test]
fn test_load_ops() {
    check_decode(
        vec![0x8D, 0x81, 0x8C, 0x05, 0xC5, 0x13, 0xC4, 0x0B, 0xD7],
        vec![
            "lea ax, [bx + di + 1420]",
            "lds dx, [bp + di]",
            "les cx, [bp + di]",
            "xlat",
        ],
    );
}

#[test]
fn test_flag_transfer_ops() {
    check_decode(
        vec![0x9C, 0x9D, 0x9E, 0x9F],
        vec!["pushf", "popf", "sahf", "lahf"],
    );
}

#[test]
fn test_alu_reg_mem() {
    check_decode(
        vec![0x01, 0xD8, 0x03, 0x18, 0x29, 0xD8, 0x39, 0xD8, 0x31, 0xC9],
        vec![
            "add ax, bx",
            "add bx, [bx + si]",
            "sub ax, bx",
            "cmp ax, bx",
            "xor cx, cx",
        ],
    );
}

#[test]
fn test_alu_imm() {
    check_decode(
        vec![
            0x80, 0x07, 0x22, // unsigned byte immediate
            0x83, 0xE9, 0x01, // sign-extended byte immediate
            0x83, 0xC6, 0xFE, // negative sign-extended immediate
            0x2D, 0xE8, 0x03, // accumulator form
            0x3C, 0x2E, // byte accumulator form
            0x81, 0x3E, 0xE2, 0x12, 0x1D, 0x25, // full 16-bit immediate
        ],
        vec![
            "add byte [bx], 34",
            "sub cx, 1",
            "add si, -2",
            "sub ax, 1000",
            "cmp al, 46",
            "cmp word [4834], 9501",
        ],
    );
}

#[test]
fn test_inc_dec() {
    check_decode(
        vec![0x40, 0x4F, 0xFE, 0x0E, 0xD0, 0x07],
        vec!["inc ax", "dec di", "dec byte [2000]"],
    );
}

#[test]
fn test_adjust_and_convert_ops() {
    check_decode(
        vec![0x37, 0x27, 0x3F, 0x2F, 0xD4, 0x0A, 0xD5, 0x0A, 0x98, 0x99],
        vec![
            "aaa", "daa", "aas", "das", "aam", "aad", "cbw", "cwd",
        ],
    );
}

#[test]
fn test_aam_illegal_second_byte() {
    check_decode_error(
        vec![0xD4, 0x0B],
        DecodeError::IllegalSecondByte {
            byte: 0xD4,
            second: 0x0B,
        },
    );
}

#[test]
fn test_grp1() {
    check_decode(
        vec![0xF6, 0xDB, 0xF7, 0x24, 0xF6, 0xC3, 0x14],
        vec!["neg bl", "mul word [si]", "test bl, 20"],
    );
}

#[test]
fn test_shifts() {
    check_decode(
        vec![0xD1, 0xE0, 0xD2, 0xE8, 0xD1, 0x26, 0x88, 0x13],
        vec!["shl ax, 1", "shr al, cl", "shl word [5000], 1"],
    );
}

#[test]
fn test_illegal_sub_ops() {
    check_decode_error(
        vec![0xFE, 0xD0],
        DecodeError::IllegalSubOp {
            byte: 0xD0,
            sub_op: 0b010,
        },
    );
    check_decode_error(
        vec![0xFF, 0xF8],
        DecodeError::IllegalSubOp {
            byte: 0xF8,
            sub_op: 0b111,
        },
    );
    check_decode_error(
        vec![0xF7, 0xCB],
        DecodeError::IllegalSubOp {
            byte: 0xCB,
            sub_op: 0b001,
        },
    );
    check_decode_error(
        vec![0xD0, 0xF0],
        DecodeError::IllegalSubOp {
            byte: 0xF0,
            sub_op: 0b110,
        },
    );
}

#[test]
fn test_test_forms() {
    check_decode(
        vec![0x85, 0xC3, 0xA9, 0x10, 0x27],
        vec!["test bx, ax", "test ax, 10000"],
    );
}

#[test]
fn test_string_ops() {
    check_decode(
        vec![0xA4, 0xF3, 0xA5, 0xF3, 0xAB, 0xF2, 0xAE, 0xAD],
        vec!["movsb", "rep movsw", "rep stosw", "rep scasb", "lodsw"],
    );
}

#[test]
fn test_rep_requires_string_op() {
    check_decode_error(vec![0xF3, 0x90], DecodeError::UnknownOpcode { byte: 0x90 });
}

#[test]
fn test_calls_and_jumps() {
    check_decode(
        vec![
            0xE8, 0x05, 0x00, // call near
            0xE9, 0xFD, 0xFF, // jmp near, back to itself
            0xEB, 0xFE, // jmp short, back to itself
            0x9A, 0xC8, 0x01, 0x7B, 0x00, // call far direct
            0xEA, 0x21, 0x00, 0x34, 0x12, // jmp far direct
        ],
        vec![
            "call $+8",
            "jmp $+0",
            "jmp $+0",
            "call 123:456",
            "jmp 4660:33",
        ],
    );
}

#[test]
fn test_indirect_calls_and_jumps() {
    check_decode(
        vec![
            0xFF, 0xD0, 0xFF, 0x17, 0xFF, 0x5D, 0x00, 0xFF, 0x25, 0xFF, 0x2C,
        ],
        vec![
            "call ax",
            "call [bx]",
            "call far [di]",
            "jmp [di]",
            "jmp far [si]",
        ],
    );
}

#[test]
fn test_rets() {
    check_decode(
        vec![0xC3, 0xC2, 0x04, 0x00, 0xCB, 0xCA, 0x02, 0x00],
        vec!["ret", "ret 4", "retf", "retf 2"],
    );
}

#[test]
fn test_conditional_jumps() {
    check_decode(
        vec![0x75, 0xFB, 0x74, 0x00, 0xE2, 0xF8, 0xE3, 0x10, 0x7C, 0x80],
        vec!["jne $-3", "je $+2", "loop $-6", "jcxz $+18", "jl $-126"],
    );
}

#[test]
fn test_interrupts() {
    check_decode(
        vec![0xCC, 0xCD, 0x0D, 0xCE, 0xCF],
        vec!["int3", "int 13", "into", "iret"],
    );
}

#[test]
fn test_processor_control() {
    check_decode(
        vec![0xF4, 0xF5, 0xF8, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0x9B],
        vec![
            "hlt", "cmc", "clc", "stc", "cli", "sti", "cld", "std", "wait",
        ],
    );
}

#[test]
fn test_esc() {
    check_decode(vec![0xD8, 0x07], vec!["esc [bx]"]);
}

#[test]
fn test_prefixes() {
    check_decode(
        vec![
            0xF0, 0x26, 0x88, 0x07, // lock + es override
            0x2E, 0x8B, 0x16, 0x10, 0x00, // cs override on a direct address
            0x36, 0x8A, 0x46, 0x02, // ss override
        ],
        vec![
            "lock mov es:[bx], al",
            "mov dx, cs:[16]",
            "mov al, ss:[bp + 2]",
        ],
    );
}

#[test]
fn test_unknown_opcode() {
    check_decode_error(vec![0x66], DecodeError::UnknownOpcode { byte: 0x66 });
}

#[test]
fn test_short_reads() {
    check_decode_error(
        vec![0x88],
        DecodeError::ShortRead {
            context: "mod r/m byte",
        },
    );
    check_decode_error(
        vec![0xB8, 0x01],
        DecodeError::ShortRead {
            context: "immediate data",
        },
    );
    check_decode_error(
        vec![0x8B, 0x41],
        DecodeError::ShortRead {
            context: "8-bit displacement",
        },
    );
}

#[test]
fn test_stream_little_endian() {
    let bytes = [0x34, 0x12, 0xFB, 0x00, 0x80];
    let mut stream = ByteStream::new(&bytes);
    assert_eq!(stream.read_u16("a"), Ok(0x1234));
    assert_eq!(stream.read_i8("b"), Ok(-5));
    assert_eq!(stream.read_i16("c"), Ok(-32768));
    assert_eq!(stream.pos(), 5);
    assert!(!stream.has_bytes());
}

#[test]
fn test_stream_short_read_leaves_position() {
    let bytes = [0xAB];
    let mut stream = ByteStream::new(&bytes);
    // A 16-bit read with one byte left must not consume it
    assert_eq!(
        stream.read_u16("x"),
        Err(DecodeError::ShortRead { context: "x" })
    );
    assert_eq!(stream.pos(), 0);
    assert_eq!(stream.read_u8("y"), Ok(0xAB));
    assert_eq!(
        stream.read_u8("z"),
        Err(DecodeError::ShortRead { context: "z" })
    );
    assert_eq!(stream.pos(), 1);
}

#[test]
fn test_instruction_addresses_and_lengths() {
    let stream = vec![0xB8, 0x01, 0x00, 0x01, 0xD8, 0xF0, 0x26, 0x88, 0x07, 0xF4];
    let (insts, err) = decode(&stream, &DecodeSettings::default());
    assert!(err.is_none());
    let addrs: Vec<usize> = insts.iter().map(|i| i.addr).collect();
    assert_eq!(addrs, vec![0, 3, 5, 9]);
    // Prefix bytes count toward the instruction length
    let lengths: Vec<u16> = insts.iter().map(|i| i.length).collect();
    assert_eq!(lengths, vec![3, 2, 4, 1]);
}

#[test]
fn test_decode_is_idempotent() {
    let stream = vec![0xB8, 0x03, 0x00, 0x01, 0xD8, 0x75, 0xFB, 0xF3, 0xA4];
    let settings = DecodeSettings::default();
    let (first, first_err) = decode(&stream, &settings);
    let (second, second_err) = decode(&stream, &settings);
    assert_eq!(first, second);
    assert_eq!(first_err, second_err);
}

#[test]
fn test_register_aliasing() {
    let mut state = init_state();
    let ax = RegOperand::word(0);
    let al = RegOperand::byte(0);
    let ah = RegOperand::byte(4);

    state.write_register(ax, 0x1234);
    assert_eq!(state.read_register(al), 0x34);
    assert_eq!(state.read_register(ah), 0x12);

    state.write_register(ah, 0xAB);
    state.write_register(al, 0xCD);
    assert_eq!(state.read_register(ax), 0xABCD);

    // Byte writes leave the other half alone
    state.write_register(ax, 0x5678);
    state.write_register(al, 0xFF);
    assert_eq!(state.read_register(ax), 0x56FF);

    // Segment registers live in their own slots
    let ds = RegOperand {
        size: OpSize::Word,
        index: 3,
        segment: true,
    };
    state.write_register(ds, 0x0777);
    assert_eq!(state.read_register(ds), 0x0777);
    assert_eq!(state.reg(Reg::Ds), 0x0777);
    // The wide bx slot is untouched by the ds write
    assert_eq!(state.reg(Reg::Bx), 0);
}

#[test]
fn test_cmp_matches_sub_flags() {
    // cmp ax, bx and sub ax, bx from identical starting states
    let mut cmp_state = init_state();
    load_program(&mut cmp_state, &[0x39, 0xD8], 0);
    cmp_state.set_reg(Reg::Ax, 5);
    cmp_state.set_reg(Reg::Bx, 7);
    let (_, err) = execute(&mut cmp_state, &ExecuteSettings::default());
    assert!(err.is_none());

    let mut sub_state = init_state();
    load_program(&mut sub_state, &[0x29, 0xD8], 0);
    sub_state.set_reg(Reg::Ax, 5);
    sub_state.set_reg(Reg::Bx, 7);
    let (_, err) = execute(&mut sub_state, &ExecuteSettings::default());
    assert!(err.is_none());

    assert_eq!(cmp_state.flags(), sub_state.flags());
    assert_eq!(cmp_state.flags(), Flags::CF | Flags::AF | Flags::SF);
    // cmp leaves its operands alone; sub writes the result back
    assert_eq!(cmp_state.reg(Reg::Ax), 5);
    assert_eq!(sub_state.reg(Reg::Ax), 0xFFFE);
}

#[test]
fn test_scenario_mov_imm() {
    let (state, lines) = run(&[0xB8, 0x01, 0x00]);
    assert_eq!(lines, vec!["mov ax, 1 ; ax:0x0->0x1 ip:0x0->0x3"]);
    assert_eq!(state.reg(Reg::Ax), 0x0001);
    assert_eq!(state.reg(Reg::Ip), 3);
}

#[test]
fn test_scenario_add() {
    let (state, lines) = run(&[0xB8, 0x03, 0x00, 0xBB, 0x02, 0x00, 0x01, 0xD8]);
    assert_eq!(
        lines,
        vec![
            "mov ax, 3 ; ax:0x0->0x3 ip:0x0->0x3",
            "mov bx, 2 ; bx:0x0->0x2 ip:0x3->0x6",
            "add ax, bx ; ax:0x3->0x5 ip:0x6->0x8 flags:->P",
        ]
    );
    assert_eq!(state.reg(Reg::Ax), 0x0005);
    assert_eq!(state.reg(Reg::Bx), 0x0002);
    assert_eq!(state.reg(Reg::Ip), 8);
    // 5 is 0b101: two set bits, so parity lands even; nothing else is set
    assert_eq!(state.flags(), Flags::PF);
}

#[test]
fn test_scenario_countdown_loop() {
    // mov cx, 3 / sub cx, 1 / jne back to the sub
    let (state, _lines) = run(&[0xB9, 0x03, 0x00, 0x83, 0xE9, 0x01, 0x75, 0xFB]);
    assert_eq!(state.reg(Reg::Cx), 0);
    assert_eq!(state.reg(Reg::Ip), 8);
    assert_eq!(state.flags(), Flags::ZF | Flags::PF);
}

#[test]
fn test_dec_countdown_loop() {
    // mov cx, 3 / dec cx / jne back to the dec
    let (state, _lines) = run(&[0xB9, 0x03, 0x00, 0x49, 0x75, 0xFD]);
    assert_eq!(state.reg(Reg::Cx), 0);
    assert_eq!(state.reg(Reg::Ip), 6);
    assert_eq!(state.flags(), Flags::ZF | Flags::PF);
}

#[test]
fn test_loop_decrements_cx() {
    // mov cx, 3 / loop back to itself
    let (state, lines) = run(&[0xB9, 0x03, 0x00, 0xE2, 0xFE]);
    assert_eq!(state.reg(Reg::Cx), 0);
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[1], "loop $+0 ; cx:0x3->0x2 ip:0x3->0x3");
    assert_eq!(state.reg(Reg::Ip), 5);
}

#[test]
fn test_scenario_cmp_zero() {
    let (state, lines) = run(&[0x3D, 0x00, 0x00]);
    assert_eq!(lines, vec!["cmp ax, 0 ; ip:0x0->0x3 flags:->PZ"]);
    assert_eq!(state.reg(Reg::Ax), 0);
    assert_eq!(state.flags(), Flags::ZF | Flags::PF);
}

#[test]
fn test_scenario_self_loop_is_bounded() {
    assert_eq!(ExecuteSettings::default().exit_after, DEFAULT_STEP_LIMIT);

    let mut state = init_state();
    load_program(&mut state, &[0xEB, 0xFE], 0);
    let settings = ExecuteSettings {
        exit_after: 100,
        ..Default::default()
    };
    let (lines, error) = execute(&mut state, &settings);
    assert!(error.is_none());
    assert_eq!(lines.len(), 100);
    // The jump lands back on itself every time
    assert_eq!(state.reg(Reg::Ip), 0);
}

#[test]
fn test_memory_operands() {
    // mov word [1000], 25 / mov bx, [1000] / add bx, 7
    let (state, _lines) = run(&[
        0xC7, 0x06, 0xE8, 0x03, 0x19, 0x00, 0x8B, 0x1E, 0xE8, 0x03, 0x83, 0xC3, 0x07,
    ]);
    assert_eq!(state.load_u16(1000), 25);
    assert_eq!(state.reg(Reg::Bx), 32);
}

#[test]
fn test_memory_uses_segment_base() {
    // mov dx, 16 / mov ds, dx / mov word [0], 99: the store lands at
    // (0x0010 << 4) + 0 = 0x100
    let (state, _lines) = run(&[
        0xBA, 0x10, 0x00, 0x8E, 0xDA, 0xC7, 0x06, 0x00, 0x00, 0x63, 0x00,
    ]);
    assert_eq!(state.load_u16(0x100), 99);
    assert_eq!(state.load_u16(0), 0xBA | (0x10 << 8));
}

#[test]
fn test_push_pop_roundtrip() {
    let mut state = init_state();
    // mov ax, 123 / push ax / pop bx
    load_program(&mut state, &[0xB8, 0x7B, 0x00, 0x50, 0x5B], 0);
    let settings = ExecuteSettings {
        init_sp: Some(0x100),
        ..Default::default()
    };
    let (_lines, error) = execute(&mut state, &settings);
    assert!(error.is_none());
    assert_eq!(state.reg(Reg::Bx), 123);
    assert_eq!(state.reg(Reg::Sp), 0x100);
}

#[test]
fn test_call_and_ret() {
    // call $+5 / hlt / mov bx, 7 / ret, with the stack up at 0x200
    let mut state = init_state();
    load_program(&mut state, &[0xE8, 0x01, 0x00, 0xF4, 0xBB, 0x07, 0x00, 0xC3], 0);
    let settings = ExecuteSettings {
        init_sp: Some(0x200),
        ..Default::default()
    };
    let (_lines, error) = execute(&mut state, &settings);
    assert!(error.is_none());
    assert_eq!(state.reg(Reg::Bx), 7);
    // ret returned to the hlt after the call
    assert_eq!(state.reg(Reg::Ip), 4);
    assert_eq!(state.reg(Reg::Sp), 0x200);
}

#[test]
fn test_rep_movsb() {
    // mov cx, 3 / mov si, 0 / mov di, 16 / rep movsb: copies the program's
    // own first three bytes up to offset 16
    let (state, lines) = run(&[
        0xB9, 0x03, 0x00, 0xBE, 0x00, 0x00, 0xBF, 0x10, 0x00, 0xF3, 0xA4,
    ]);
    assert_eq!(&state.memory[16..19], &[0xB9, 0x03, 0x00]);
    assert_eq!(state.reg(Reg::Si), 3);
    assert_eq!(state.reg(Reg::Di), 19);
    assert_eq!(state.reg(Reg::Cx), 0);
    assert_eq!(
        lines.last().unwrap(),
        "rep movsb ; si:0x0->0x3 di:0x10->0x13 cx:0x3->0x0 ip:0x9->0xb"
    );
}

#[test]
fn test_conditional_jump_taken() {
    // mov ax, 1 / cmp ax, 2 / jl over the last mov
    let (state, _lines) = run(&[
        0xB8, 0x01, 0x00, 0x3D, 0x02, 0x00, 0x7C, 0x03, 0xBB, 0x05, 0x00,
    ]);
    assert_eq!(state.reg(Reg::Bx), 0);
    assert_eq!(state.reg(Reg::Ip), 11);
    assert_eq!(state.flags(), Flags::CF | Flags::PF | Flags::AF | Flags::SF);
}

#[test]
fn test_conditional_jump_not_taken() {
    // mov ax, 3 / cmp ax, 2 / jl over the last mov: 3 < 2 is false
    let (state, _lines) = run(&[
        0xB8, 0x03, 0x00, 0x3D, 0x02, 0x00, 0x7C, 0x03, 0xBB, 0x05, 0x00,
    ]);
    assert_eq!(state.reg(Reg::Bx), 5);
}

#[test]
fn test_jcxz_does_not_decrement() {
    // jcxz over a mov, with cx already zero
    let (state, _lines) = run(&[0xE3, 0x03, 0xBB, 0x05, 0x00]);
    assert_eq!(state.reg(Reg::Cx), 0);
    assert_eq!(state.reg(Reg::Bx), 0);
}

#[test]
fn test_hlt_stops_the_run() {
    let (state, lines) = run(&[0xB8, 0x01, 0x00, 0xF4, 0xBB, 0x02, 0x00]);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1], "hlt ; ip:0x3->0x4");
    assert_eq!(state.reg(Reg::Bx), 0);
}

#[test]
fn test_byte_arithmetic_flags() {
    // mov al, 0x7F / add al, 1: byte-wide signed overflow
    let (state, _lines) = run(&[0xB0, 0x7F, 0x04, 0x01]);
    assert_eq!(state.read_register(RegOperand::byte(0)), 0x80);
    let flags = state.flags();
    assert!(flags.contains(Flags::OF));
    assert!(flags.contains(Flags::SF));
    assert!(flags.contains(Flags::AF));
    assert!(!flags.contains(Flags::CF));
    assert!(!flags.contains(Flags::ZF));
}

#[test]
fn test_unimplemented_execution() {
    let mut state = init_state();
    load_program(&mut state, &[0xF7, 0xE3], 0);
    let (lines, error) = execute(&mut state, &ExecuteSettings::default());
    assert!(lines.is_empty());
    match error {
        Some(ExecError::Unimplemented { mnemonic }) => assert_eq!(mnemonic, "mul"),
        other => panic!("expected an unimplemented-execution error, got {other:?}"),
    }
}

#[test]
fn test_decode_error_stops_execution() {
    let mut state = init_state();
    load_program(&mut state, &[0x66], 0);
    let (lines, error) = execute(&mut state, &ExecuteSettings::default());
    assert!(lines.is_empty());
    assert!(matches!(
        error,
        Some(ExecError::Decode(DecodeError::UnknownOpcode { byte: 0x66 }))
    ));
}

#[test]
fn test_physical_address() {
    assert_eq!(physical_address(0x0000, 0x0005), 0x00005);
    assert_eq!(physical_address(0x1000, 0x0005), 0x10005);
    assert_eq!(physical_address(0xFFFF, 0x000F), 0xFFFFF);
}

#[test]
fn test_final_state_format() {
    let (state, _lines) = run(&[0xB8, 0x03, 0x00, 0xBB, 0x02, 0x00, 0x01, 0xD8]);
    let final_lines = print_final_state(&state);
    assert_eq!(
        final_lines,
        vec![
            "",
            "Final registers:",
            "      ax: 0x0005 (5)",
            "      bx: 0x0002 (2)",
            "      ip: 0x0008 (8)",
            "   flags: P",
            "",
        ]
    );
}
