mod common;

use proptest::prelude::*;
use spirt_gpuav::spv::spec::Spec;
use spirt_gpuav::Module;

const ALL_SHADERS: [&str; 5] = [
    common::INDEXED_ARRAY,
    common::SAMPLED_TEXTURES,
    common::DEVICE_ADDRESS,
    common::RAY_QUERY,
    common::TRIVIAL,
];

/// Opcodes (and operand words) of every instruction, skipping the header.
fn insts(words: &[u32]) -> Vec<&[u32]> {
    let mut insts = vec![];
    let mut rest = &words[5..];
    while let Some(&first) = rest.first() {
        let (inst, tail) = rest.split_at((first >> 16) as usize);
        insts.push(inst);
        rest = tail;
    }
    insts
}

#[test]
fn serialize_parse_round_trip() {
    for src in ALL_SHADERS {
        let words = common::assemble(src);
        let module = Module::parse_spv_words(&words).unwrap();
        let out = module.serialize_to_spv_words().unwrap();

        assert_eq!(out[..4], words[..4]);
        assert_eq!(insts(&out), insts(&words));

        let again = Module::parse_spv_words(&out).unwrap().serialize_to_spv_words().unwrap();
        assert_eq!(again, out);
    }
}

#[test]
fn byte_swapped_modules_parse_the_same() {
    let words = common::assemble(common::INDEXED_ARRAY);
    let swapped: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    let native = Module::parse_spv_bytes(&common::to_bytes(&words)).unwrap();
    let swapped = Module::parse_spv_bytes(&swapped).unwrap();
    assert_eq!(
        swapped.serialize_to_spv_words().unwrap(),
        native.serialize_to_spv_words().unwrap()
    );
}

#[test]
fn truncated_modules_are_errors() {
    let bytes = common::to_bytes(&common::assemble(common::TRIVIAL));
    assert!(Module::parse_spv_bytes(&bytes[..3]).is_err());
    assert!(Module::parse_spv_bytes(&bytes[..bytes.len() - 4]).is_err());
    assert!(Module::parse_spv_bytes(&[]).is_err());
}

#[test]
fn modules_group_blocks_into_functions() {
    let wk = &Spec::get().well_known;
    let module = Module::parse_spv_words(&common::assemble(common::INDEXED_ARRAY)).unwrap();
    assert_eq!(module.funcs.len(), 1);
    let entry = &module.funcs[0].blocks[0];
    assert_eq!(entry.insts.iter().filter(|inst| inst.opcode == wk.OpLoad).count(), 2);
    assert_eq!(entry.terminator().map(|inst| inst.opcode), Some(wk.OpReturn));
}

proptest! {
    #[test]
    fn parsing_arbitrary_bytes_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = Module::parse_spv_bytes(&bytes);
    }

    #[test]
    fn parsing_corrupted_shaders_never_panics(
        index in 0usize..1000,
        word in any::<u32>(),
    ) {
        let mut words = common::assemble(common::SAMPLED_TEXTURES);
        let len = words.len();
        words[index % len] = word;
        if let Ok(module) = Module::parse_spv_words(&words) {
            let _ = module.serialize_to_spv_words();
        }
    }
}
