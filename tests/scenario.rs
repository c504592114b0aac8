use std::sync::Arc;

use pm4_cmdstream::stream::{
    RegisterFile, ReplayMemory, Replayer, UserDataArgs, UserDataEntryMap,
};
use pm4_cmdstream::{
    BeginFlags, CmdStream, CmdStreamConfig, CompareFunc, CondCompare, LinearCmdAllocator,
    OptimizationMode, RegisterTable, ShaderType,
};
use pretty_assertions::assert_eq;

const PREDICATE_VA: u64 = 0x2000;
const USER_DATA: [u32; 4] = [0x11, 0x22, 0x33, 0x44];

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

fn load_config(mode: &str) -> (CmdStreamConfig, RegisterTable) {
    let config: CmdStreamConfig = serde_json::from_str(&format!(
        r#"{{ "optimization": "{mode}", "chunk_size_words": 40, "reserve_limit_words": 24 }}"#
    ))
    .unwrap();
    let registers: RegisterTable =
        serde_json::from_str(r#"{ "non_cacheable": [41728], "privileged_config": [8448] }"#)
            .unwrap();
    (config, registers)
}

/// Records a few draws' worth of state the way a command buffer builder would.
fn record_frame(mode: &str) -> (CmdStream<LinearCmdAllocator>, CmdStream<LinearCmdAllocator>) {
    let (config, registers) = load_config(mode);
    let registers = Arc::new(registers);

    let mut bundle = CmdStream::new(
        config.clone().nested(true),
        Arc::clone(&registers),
        LinearCmdAllocator::new(0x200_0000),
    )
    .unwrap();
    bundle.begin(BeginFlags::OPTIMIZE_COMMANDS).unwrap();
    let cursor = bundle.reserve_commands().unwrap();
    let cursor = bundle.write_set_seq_context_regs(0xA0C0, 0xA0C3, &[9, 9, 9, 9], cursor);
    bundle.commit_commands(cursor);
    bundle.end();

    let mut stream = CmdStream::new(
        config,
        registers,
        LinearCmdAllocator::new(0x100_0000),
    )
    .unwrap();
    stream.begin(BeginFlags::OPTIMIZE_COMMANDS).unwrap();

    let vs_map = UserDataEntryMap::new().with_range(0, 0x2C4C, 8);
    let cs_map = UserDataEntryMap::new().with_range(0, 0x2E40, 4);

    for draw in 0..6u32 {
        let mut cursor = stream.reserve_commands().unwrap();
        cursor = stream.write_set_seq_context_regs(0xA0C0, 0xA0C3, &[1, 2, draw % 2, 4], cursor);
        cursor = stream.write_set_one_context_reg(0xA300, draw, cursor);
        cursor = stream.write_context_reg_rmw(0xA301, 0xF0, draw << 4, cursor);
        cursor = stream.write_user_data_registers(
            &vs_map,
            &UserDataArgs {
                first_entry: 1,
                values: &[draw, 7, 7],
            },
            ShaderType::Graphics,
            cursor,
        );
        cursor = stream.write_user_data_register_offset(
            &cs_map,
            &UserDataArgs {
                first_entry: 2,
                values: &[draw % USER_DATA.len() as u32],
            },
            ShaderType::Compute,
            cursor,
        );
        cursor = stream.write_set_one_config_reg(0xC258, draw, cursor);
        cursor = stream.write_set_one_perf_ctr_reg(0x2100, draw + 100, cursor);
        stream.commit_commands(cursor);
    }

    let cursor = stream.reserve_commands().unwrap();
    let cursor = stream.execute_nested(&bundle, cursor);
    stream.commit_commands(cursor);

    stream
        .begin_if(CondCompare {
            func: CompareFunc::NotEqual,
            compare_va: PREDICATE_VA,
            reference: 0,
            mask: 0xFF,
        })
        .unwrap();
    let cursor = stream.reserve_commands().unwrap();
    let cursor = stream.write_set_one_sh_reg(0x2C4C, 0xBEEF, ShaderType::Graphics, cursor);
    stream.commit_commands(cursor);
    stream.begin_else().unwrap();
    let cursor = stream.reserve_commands().unwrap();
    let cursor = stream.write_set_one_sh_reg(0x2C4C, 0xF00D, ShaderType::Graphics, cursor);
    stream.commit_commands(cursor);
    stream.end_if().unwrap();

    let cursor = stream.reserve_commands().unwrap();
    let cursor = stream.write_set_one_context_reg(0xA0C0, 1, cursor);
    stream.commit_commands(cursor);
    stream.end();

    (stream, bundle)
}

fn replay(
    stream: &CmdStream<LinearCmdAllocator>,
    bundle: &CmdStream<LinearCmdAllocator>,
    predicate: u64,
) -> RegisterFile {
    let mut memory = ReplayMemory::new();
    memory.add_stream(stream);
    memory.add_stream(bundle);
    memory.write_u64(PREDICATE_VA, predicate);
    let mut regs = RegisterFile::new();
    Replayer::new(&memory)
        .with_user_data(&USER_DATA)
        .execute_stream(&mut regs, stream)
        .unwrap();
    regs
}

fn recorded_words(stream: &CmdStream<LinearCmdAllocator>) -> usize {
    stream.chunks().iter().map(|c| c.used()).sum()
}

#[test]
fn every_mode_produces_the_same_frame() {
    init_logging();
    let (raw, raw_bundle) = record_frame("none");

    for predicate in [0, 0x100, 3] {
        let expected = replay(&raw, &raw_bundle, predicate);
        for mode in ["immediate", "finalized"] {
            let (stream, bundle) = record_frame(mode);
            assert_eq!(replay(&stream, &bundle, predicate), expected, "{mode}");
        }
    }

    let (immediate, _) = record_frame("immediate");
    assert!(recorded_words(&immediate) < recorded_words(&raw));
    assert!(immediate.stats().optimizer.regs_elided > 0);
}

#[test]
fn frame_state_matches_the_last_writes() {
    let (stream, bundle) = record_frame("immediate");

    // Masked predicate 0x100 & 0xFF == 0: else branch.
    let regs = replay(&stream, &bundle, 0x100);
    assert_eq!(regs.get(0x2C4C), Some(0xF00D));
    assert_eq!(replay(&stream, &bundle, 3).get(0x2C4C), Some(0xBEEF));

    assert_eq!(regs.get(0xA0C0), Some(1));
    assert_eq!(regs.get(0xA0C1), Some(9));
    assert_eq!(regs.get(0xA300), Some(5));
    assert_eq!(regs.get(0xA301), Some(0x50));
    assert_eq!(regs.get(0x2C4D), Some(5));
    assert_eq!(regs.get(0x2E42), Some(USER_DATA[1]));
    assert_eq!(regs.get(0xC258), Some(5));
    assert_eq!(regs.get(0x2100), Some(105));
}
