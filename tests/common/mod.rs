//! Minimal SPIR-V assembler for tests, and the shaders used across them.
//!
//! The syntax is a subset of `spirv-dis` output: one instruction per line,
//! `%name = OpFoo %result_type operands...` (or `OpFoo operands...`), with
//! operands being `%ids`, integers, floats (containing a `.`), `"strings"`, or
//! enumerant names from [`ENUMERANTS`]. `; version X.Y` sets the module version,
//! other `;` lines are comments. IDs are numbered in order of first appearance.

#![allow(dead_code)]

use lazy_static::lazy_static;
use rustc_hash::FxHashMap;
use spirt_gpuav::spv::spec::Opcode;

const ENUMERANTS: &[(&str, u32)] = &[
    // Capability
    ("Shader", 1),
    ("Linkage", 5),
    ("Int64", 11),
    ("RuntimeDescriptorArray", 5302),
    ("RayQueryKHR", 4472),
    ("PhysicalStorageBufferAddresses", 5347),
    // AddressingModel / MemoryModel
    ("Logical", 0),
    ("PhysicalStorageBuffer64", 5348),
    ("GLSL450", 1),
    // ExecutionModel / ExecutionMode
    ("Vertex", 0),
    ("Fragment", 4),
    ("GLCompute", 5),
    ("OriginUpperLeft", 7),
    ("LocalSize", 17),
    // StorageClass
    ("UniformConstant", 0),
    ("Input", 1),
    ("Uniform", 2),
    ("Output", 3),
    ("Private", 6),
    ("Function", 7),
    ("PushConstant", 9),
    ("StorageBuffer", 12),
    ("PhysicalStorageBuffer", 5349),
    // Decoration
    ("Block", 2),
    ("ArrayStride", 6),
    ("Binding", 33),
    ("DescriptorSet", 34),
    ("Offset", 35),
    // Dim / ImageFormat
    ("2D", 1),
    ("Unknown", 0),
    // FunctionControl / SelectionControl / LoopControl / MemoryAccess
    ("None", 0),
    ("Aligned", 2),
];

lazy_static! {
    static ref OPCODES: FxHashMap<&'static str, (Opcode, bool)> = (0..=u16::MAX)
        .filter_map(|op| {
            let (opcode, name, def) = Opcode::try_from_u16_with_name_and_def(op)?;
            Some((name, (opcode, def.has_result_type_id)))
        })
        .collect();
}

fn tokenize(line: &str) -> Vec<&str> {
    let mut tokens = vec![];
    let mut rest = line.trim();
    while !rest.is_empty() {
        let end = if let Some(quoted) = rest.strip_prefix('"') {
            quoted.find('"').map_or(rest.len(), |i| i + 2)
        } else {
            rest.find(char::is_whitespace).unwrap_or(rest.len())
        };
        tokens.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    tokens
}

fn string_words(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes.chunks(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

/// Assemble `src` into SPIR-V words (panicking on any syntax error).
pub fn assemble(src: &str) -> Vec<u32> {
    let mut ids = FxHashMap::default();
    let mut id = |name: &str| {
        let next = ids.len() as u32 + 1;
        *ids.entry(name.to_string()).or_insert(next)
    };

    let mut version = (1, 3);
    let mut body = vec![];
    for line in src.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(comment) = line.strip_prefix(';') {
            if let Some(v) = comment.trim().strip_prefix("version ") {
                let (major, minor) = v.split_once('.').expect("`; version X.Y`");
                version = (major.parse().unwrap(), minor.parse().unwrap());
            }
            continue;
        }

        let mut tokens = tokenize(line);
        let result = if tokens.get(1) == Some(&"=") {
            let result = tokens[0].strip_prefix('%').expect("result must be an %id");
            tokens.drain(..2);
            Some(result)
        } else {
            None
        };
        let (opcode, has_result_type) = *OPCODES
            .get(tokens[0])
            .unwrap_or_else(|| panic!("unknown opcode `{}`", tokens[0]));

        let mut operands = tokens[1..].iter().copied();
        let mut words = vec![];
        if let Some(result) = result {
            if has_result_type {
                let ty = operands.next().and_then(|t| t.strip_prefix('%')).expect("result type");
                words.push(id(ty));
            }
            words.push(id(result));
        }
        for operand in operands {
            if let Some(name) = operand.strip_prefix('%') {
                words.push(id(name));
            } else if let Some(s) = operand.strip_prefix('"') {
                words.extend(string_words(s.strip_suffix('"').expect("closing quote")));
            } else if let Some(&(_, value)) = ENUMERANTS.iter().find(|(n, _)| *n == operand) {
                words.push(value);
            } else if operand.contains('.') {
                words.push(operand.parse::<f32>().expect("float literal").to_bits());
            } else if let Some(hex) = operand.strip_prefix("0x") {
                words.push(u32::from_str_radix(hex, 16).expect("hex literal"));
            } else {
                words.push(operand.parse::<i64>().expect("integer literal") as u32);
            }
        }
        body.push(((words.len() as u32 + 1) << 16) | u32::from(opcode.as_u16()));
        body.extend(words);
    }

    let bound = ids.len() as u32 + 1;
    let mut spv = vec![0x0723_0203, (version.0 << 16) | (version.1 << 8), 0, bound, 0];
    spv.extend(body);
    spv
}

pub fn to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Compute shader indexing a fixed-size array in a storage buffer with an
/// index read from that same buffer.
pub const INDEXED_ARRAY: &str = r#"
    OpCapability Shader
    OpMemoryModel Logical GLSL450
    OpEntryPoint GLCompute %main "main"
    OpExecutionMode %main LocalSize 1 1 1
    OpName %main "main"
    OpDecorate %arr ArrayStride 4
    OpMemberDecorate %Buf 0 Offset 0
    OpMemberDecorate %Buf 1 Offset 16
    OpDecorate %Buf Block
    OpDecorate %buf DescriptorSet 0
    OpDecorate %buf Binding 0
    %void = OpTypeVoid
    %fn = OpTypeFunction %void
    %u32 = OpTypeInt 32 0
    %c0 = OpConstant %u32 0
    %c1 = OpConstant %u32 1
    %c4 = OpConstant %u32 4
    %arr = OpTypeArray %u32 %c4
    %Buf = OpTypeStruct %arr %u32
    %ptr_Buf = OpTypePointer StorageBuffer %Buf
    %ptr_u32 = OpTypePointer StorageBuffer %u32
    %buf = OpVariable %ptr_Buf StorageBuffer
    %main = OpFunction %void None %fn
    %entry = OpLabel
    %pi = OpAccessChain %ptr_u32 %buf %c1
    %i = OpLoad %u32 %pi
    %pe = OpAccessChain %ptr_u32 %buf %c0 %i
    %v = OpLoad %u32 %pe
    OpStore %pi %v
    OpReturn
    OpFunctionEnd
"#;

/// Fragment shader sampling from an array of combined image samplers, with a
/// dynamic index.
pub const SAMPLED_TEXTURES: &str = r#"
    OpCapability Shader
    OpMemoryModel Logical GLSL450
    OpEntryPoint Fragment %main "main" %uv %color
    OpExecutionMode %main OriginUpperLeft
    OpDecorate %textures DescriptorSet 1
    OpDecorate %textures Binding 2
    OpDecorate %Idx Block
    OpMemberDecorate %Idx 0 Offset 0
    OpDecorate %idx DescriptorSet 0
    OpDecorate %idx Binding 0
    %void = OpTypeVoid
    %fn = OpTypeFunction %void
    %f32 = OpTypeFloat 32
    %u32 = OpTypeInt 32 0
    %c0 = OpConstant %u32 0
    %c8 = OpConstant %u32 8
    %v2 = OpTypeVector %f32 2
    %v4 = OpTypeVector %f32 4
    %img = OpTypeImage %f32 2D 0 0 0 1 Unknown
    %simg = OpTypeSampledImage %img
    %arr = OpTypeArray %simg %c8
    %ptr_arr = OpTypePointer UniformConstant %arr
    %ptr_simg = OpTypePointer UniformConstant %simg
    %Idx = OpTypeStruct %u32
    %ptr_Idx = OpTypePointer Uniform %Idx
    %ptr_u32 = OpTypePointer Uniform %u32
    %ptr_in = OpTypePointer Input %v2
    %ptr_out = OpTypePointer Output %v4
    %textures = OpVariable %ptr_arr UniformConstant
    %idx = OpVariable %ptr_Idx Uniform
    %uv = OpVariable %ptr_in Input
    %color = OpVariable %ptr_out Output
    %main = OpFunction %void None %fn
    %entry = OpLabel
    %pi = OpAccessChain %ptr_u32 %idx %c0
    %i = OpLoad %u32 %pi
    %pt = OpAccessChain %ptr_simg %textures %i
    %t = OpLoad %simg %pt
    %coords = OpLoad %v2 %uv
    %texel = OpImageSampleImplicitLod %v4 %t %coords
    OpStore %color %texel
    OpReturn
    OpFunctionEnd
"#;

/// Compute shader loading through a buffer device address.
pub const DEVICE_ADDRESS: &str = r#"
    OpCapability Shader
    OpCapability Int64
    OpCapability PhysicalStorageBufferAddresses
    OpExtension "SPV_KHR_physical_storage_buffer"
    OpMemoryModel PhysicalStorageBuffer64 GLSL450
    OpEntryPoint GLCompute %main "main"
    OpExecutionMode %main LocalSize 1 1 1
    OpDecorate %Push Block
    OpMemberDecorate %Push 0 Offset 0
    %void = OpTypeVoid
    %fn = OpTypeFunction %void
    %u32 = OpTypeInt 32 0
    %u64 = OpTypeInt 64 0
    %c0 = OpConstant %u32 0
    %ptr_data = OpTypePointer PhysicalStorageBuffer %u32
    %Push = OpTypeStruct %u64
    %ptr_Push = OpTypePointer PushConstant %Push
    %ptr_pc_u64 = OpTypePointer PushConstant %u64
    %push = OpVariable %ptr_Push PushConstant
    %main = OpFunction %void None %fn
    %entry = OpLabel
    %pa = OpAccessChain %ptr_pc_u64 %push %c0
    %a = OpLoad %u64 %pa
    %p = OpConvertUToPtr %ptr_data %a
    %v = OpLoad %u32 %p Aligned 4
    %v2 = OpIAdd %u32 %v %v
    OpStore %p %v2 Aligned 4
    OpReturn
    OpFunctionEnd
"#;

/// Compute shader initializing a ray query from push constants.
pub const RAY_QUERY: &str = r#"
    ; version 1.4
    OpCapability Shader
    OpCapability RayQueryKHR
    OpExtension "SPV_KHR_ray_query"
    OpMemoryModel Logical GLSL450
    OpEntryPoint GLCompute %main "main" %accel %push %query
    OpExecutionMode %main LocalSize 1 1 1
    OpDecorate %accel DescriptorSet 0
    OpDecorate %accel Binding 0
    OpDecorate %Push Block
    OpMemberDecorate %Push 0 Offset 0
    OpMemberDecorate %Push 1 Offset 4
    %void = OpTypeVoid
    %fn = OpTypeFunction %void
    %u32 = OpTypeInt 32 0
    %f32 = OpTypeFloat 32
    %v3 = OpTypeVector %f32 3
    %c0 = OpConstant %u32 0
    %c1 = OpConstant %u32 1
    %cull = OpConstant %u32 255
    %zero = OpConstant %f32 0.0
    %one = OpConstant %f32 1.0
    %origin = OpConstantComposite %v3 %zero %zero %zero
    %dir = OpConstantComposite %v3 %zero %zero %one
    %as = OpTypeAccelerationStructureKHR
    %ptr_as = OpTypePointer UniformConstant %as
    %rq = OpTypeRayQueryKHR
    %ptr_rq = OpTypePointer Private %rq
    %Push = OpTypeStruct %u32 %f32
    %ptr_Push = OpTypePointer PushConstant %Push
    %ptr_pc_u32 = OpTypePointer PushConstant %u32
    %ptr_pc_f32 = OpTypePointer PushConstant %f32
    %accel = OpVariable %ptr_as UniformConstant
    %push = OpVariable %ptr_Push PushConstant
    %query = OpVariable %ptr_rq Private
    %main = OpFunction %void None %fn
    %entry = OpLabel
    %pf = OpAccessChain %ptr_pc_u32 %push %c0
    %flags = OpLoad %u32 %pf
    %pt = OpAccessChain %ptr_pc_f32 %push %c1
    %tmax = OpLoad %f32 %pt
    %a = OpLoad %as %accel
    OpRayQueryInitializeKHR %query %a %flags %cull %origin %zero %dir %tmax
    OpReturn
    OpFunctionEnd
"#;

/// A module with nothing to instrument.
pub const TRIVIAL: &str = r#"
    OpCapability Shader
    OpMemoryModel Logical GLSL450
    OpEntryPoint GLCompute %main "main"
    OpExecutionMode %main LocalSize 1 1 1
    %void = OpTypeVoid
    %fn = OpTypeFunction %void
    %main = OpFunction %void None %fn
    %entry = OpLabel
    OpReturn
    OpFunctionEnd
"#;

/// Compute shader with a dynamic index in a loop header, which can't be guarded.
pub const LOOP_HEADER_ACCESS: &str = r#"
    OpCapability Shader
    OpMemoryModel Logical GLSL450
    OpEntryPoint GLCompute %main "main"
    OpExecutionMode %main LocalSize 1 1 1
    OpDecorate %arr ArrayStride 4
    OpMemberDecorate %Buf 0 Offset 0
    OpMemberDecorate %Buf 1 Offset 16
    OpDecorate %Buf Block
    OpDecorate %buf DescriptorSet 0
    OpDecorate %buf Binding 0
    %void = OpTypeVoid
    %fn = OpTypeFunction %void
    %bool = OpTypeBool
    %false = OpConstantFalse %bool
    %u32 = OpTypeInt 32 0
    %c0 = OpConstant %u32 0
    %c1 = OpConstant %u32 1
    %c4 = OpConstant %u32 4
    %arr = OpTypeArray %u32 %c4
    %Buf = OpTypeStruct %arr %u32
    %ptr_Buf = OpTypePointer StorageBuffer %Buf
    %ptr_u32 = OpTypePointer StorageBuffer %u32
    %buf = OpVariable %ptr_Buf StorageBuffer
    %main = OpFunction %void None %fn
    %entry = OpLabel
    %pi = OpAccessChain %ptr_u32 %buf %c1
    OpBranch %header
    %header = OpLabel
    %i = OpLoad %u32 %pi
    %pe = OpAccessChain %ptr_u32 %buf %c0 %i
    %v = OpLoad %u32 %pe
    OpLoopMerge %merge %cont None
    OpBranch %cont
    %cont = OpLabel
    OpBranchConditional %false %header %merge
    %merge = OpLabel
    OpReturn
    OpFunctionEnd
"#;
