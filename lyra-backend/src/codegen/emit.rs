//!
//! Relocatable-object emission.
//!

use std::collections::BTreeMap;

use object::write::Object;
use object::write::Relocation;
use object::write::Symbol;
use object::write::SymbolSection;

use crate::mc::McInst;
use crate::mc::McOperand;
use crate::mc::encoder::EncodeError;
use crate::mc::encoder::encode;
use crate::metadata::KernelDescriptor;
use crate::metadata::KernelMetadata;
use crate::metadata::encode_metadata_note;
use crate::mir::BlockId;
use crate::mir::MachineFunction;
use crate::mir::MachineInst;
use crate::mir::MachineModule;
use crate::mir::MachineOperand;
use crate::mir::OperandRegister;
use crate::target::Register;
use crate::target::opcode::Opcode;

/// The ELF machine number of AMD GPU code objects, patched into the header
/// after generic writing.
const EM_AMDGPU: u16 = 224;

///
/// The emission error.
///
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    /// An instruction failed to encode.
    #[error("encoding `{function}`: {source}")]
    Encode {
        /// The function being encoded.
        function: String,
        /// The encoder error.
        source: EncodeError,
    },
    /// A branch target is out of the 16-bit displacement range, or an
    /// operand survived that only exists inside machine IR.
    #[error("layout of `{function}`: {reason}")]
    Layout {
        /// The function being laid out.
        function: String,
        /// What went wrong.
        reason: String,
    },
    /// The object writer reported failure.
    #[error("object writing: {0}")]
    Object(String),
}

///
/// A global variable to place into the emitted object.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitGlobal {
    /// The symbol name.
    pub name: String,
    /// The size in bytes.
    pub size: u64,
    /// The alignment in bytes.
    pub align: u64,
    /// The initializer; zero-initialized storage when absent.
    pub initializer: Option<Vec<u8>>,
    /// Whether the symbol is defined elsewhere and stays undefined here.
    pub is_external: bool,
}

///
/// The emission input: the machine module plus everything that belongs in
/// the object around the code.
///
#[derive(Debug)]
pub struct EmitInput<'a> {
    /// The machine module.
    pub module: &'a MachineModule,
    /// Metadata of the kernels in the module, driving descriptor and note
    /// emission.
    pub kernels: &'a [KernelMetadata],
    /// The global variables.
    pub globals: &'a [EmitGlobal],
}

/// One function's code lowered to encodable items.
enum Item {
    Plain(McInst),
    /// An instruction whose trailing literal is a relocation site.
    PlainReloc {
        inst: McInst,
        symbol: String,
        r_type: u16,
    },
    Branch { opcode: Opcode, target: BlockId },
    GlobalAddr { dest: Register, symbol: String },
}

impl Item {
    fn size(&self, function_name: &str) -> Result<u64, EmitError> {
        match self {
            Item::Plain(inst) | Item::PlainReloc { inst, .. } => {
                let mut scratch = Vec::with_capacity(8);
                let size = encode(inst, &mut scratch).map_err(|source| EmitError::Encode {
                    function: function_name.to_owned(),
                    source,
                })?;
                Ok(size as u64)
            }
            Item::Branch { .. } => Ok(4),
            // s_getpc + s_add with literal + s_addc with literal.
            Item::GlobalAddr { .. } => Ok(20),
        }
    }
}

///
/// Emits the module as a relocatable ELF byte buffer.
///
pub fn emit_relocatable(input: &EmitInput<'_>) -> Result<Vec<u8>, EmitError> {
    let mut object = Object::new(
        object::BinaryFormat::Elf,
        object::Architecture::X86_64,
        object::Endianness::Little,
    );

    let text_section =
        object.add_section(Vec::new(), b".text".to_vec(), object::SectionKind::Text);
    let rodata_section = object.add_section(
        Vec::new(),
        b".rodata".to_vec(),
        object::SectionKind::ReadOnlyData,
    );
    let data_section =
        object.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
    let bss_section = object.add_section(
        Vec::new(),
        b".bss".to_vec(),
        object::SectionKind::UninitializedData,
    );

    // Globals first, so code relocations can refer to them.
    let mut symbol_ids: BTreeMap<String, object::write::SymbolId> = BTreeMap::new();
    for global in input.globals.iter() {
        let symbol_id = if global.is_external {
            object.add_symbol(Symbol {
                name: global.name.clone().into_bytes(),
                value: 0,
                size: 0,
                kind: object::SymbolKind::Data,
                scope: object::SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Undefined,
                flags: object::SymbolFlags::None,
            })
        } else {
            let align = global.align.max(4);
            let (section, offset) = match global.initializer.as_ref() {
                Some(initializer) => (
                    data_section,
                    object.append_section_data(data_section, initializer.as_slice(), align),
                ),
                None => (
                    bss_section,
                    object.append_section_bss(bss_section, global.size, align),
                ),
            };
            object.add_symbol(Symbol {
                name: global.name.clone().into_bytes(),
                value: offset,
                size: global.size,
                kind: object::SymbolKind::Data,
                scope: object::SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(section),
                flags: object::SymbolFlags::None,
            })
        };
        symbol_ids.insert(global.name.clone(), symbol_id);
    }

    let metadata_by_symbol: BTreeMap<&str, &KernelMetadata> = input
        .kernels
        .iter()
        .map(|metadata| (metadata.symbol.as_str(), metadata))
        .collect();

    for function in input.module.functions() {
        let (code, relocations) = encode_function(function)?;
        let offset = object.append_section_data(text_section, code.as_slice(), 256);
        object.add_symbol(Symbol {
            name: function.name().as_bytes().to_vec(),
            value: offset,
            size: code.len() as u64,
            kind: object::SymbolKind::Text,
            scope: object::SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text_section),
            flags: object::SymbolFlags::None,
        });

        for (relocation_offset, symbol_name, r_type) in relocations {
            let symbol_id = match symbol_ids.get(symbol_name.as_str()) {
                Some(symbol_id) => *symbol_id,
                None => {
                    // A reference to another function of the same module.
                    let symbol_id = object.add_symbol(Symbol {
                        name: symbol_name.clone().into_bytes(),
                        value: 0,
                        size: 0,
                        kind: object::SymbolKind::Text,
                        scope: object::SymbolScope::Linkage,
                        weak: false,
                        section: SymbolSection::Undefined,
                        flags: object::SymbolFlags::None,
                    });
                    symbol_ids.insert(symbol_name.clone(), symbol_id);
                    symbol_id
                }
            };
            object
                .add_relocation(
                    text_section,
                    Relocation {
                        offset: offset + relocation_offset,
                        symbol: symbol_id,
                        addend: 0,
                        flags: object::RelocationFlags::Elf {
                            r_type: r_type as u32,
                        },
                    },
                )
                .map_err(|error| EmitError::Object(error.to_string()))?;
        }

        if function.is_kernel() {
            if let Some(metadata) = metadata_by_symbol.get(function.name()) {
                let descriptor = KernelDescriptor {
                    group_segment_fixed_size: metadata.group_segment_fixed_size,
                    private_segment_fixed_size: metadata.private_segment_fixed_size,
                    kernarg_size: metadata.kernarg_segment_size,
                    kernel_code_entry_byte_offset: 0,
                    vgpr_count: metadata.vgpr_count,
                    sgpr_count: metadata.sgpr_count,
                    user_sgpr_count: metadata.user_sgpr_count,
                    enables_private_segment: metadata.private_segment_fixed_size > 0,
                };
                let descriptor_offset = object.append_section_data(
                    rodata_section,
                    descriptor.to_bytes().as_slice(),
                    64,
                );
                object.add_symbol(Symbol {
                    name: metadata.descriptor_symbol().into_bytes(),
                    value: descriptor_offset,
                    size: KernelDescriptor::SIZE as u64,
                    kind: object::SymbolKind::Data,
                    scope: object::SymbolScope::Linkage,
                    weak: false,
                    section: SymbolSection::Section(rodata_section),
                    flags: object::SymbolFlags::None,
                });
            }
        }
    }

    if !input.kernels.is_empty() {
        let note_section = object.add_section(
            Vec::new(),
            b".note.lyra".to_vec(),
            object::SectionKind::Note,
        );
        let note = encode_metadata_note(input.kernels);
        object.append_section_data(note_section, note.as_slice(), 4);
    }

    let mut bytes = object
        .write()
        .map_err(|error| EmitError::Object(error.to_string()))?;
    patch_machine(&mut bytes);
    Ok(bytes)
}

/// Stamps the AMD GPU machine number over the generic one the writer used.
fn patch_machine(bytes: &mut [u8]) {
    if bytes.len() >= 20 {
        bytes[18..20].copy_from_slice(&EM_AMDGPU.to_le_bytes());
    }
}

/// AMD GPU relocation types used by the emitter.
const R_AMDGPU_REL32_LO: u16 = 10;
const R_AMDGPU_REL32_HI: u16 = 11;

///
/// Encodes one function: expands pseudos, lays out blocks, resolves branch
/// displacements, and collects relocation records.
///
fn encode_function(
    function: &MachineFunction,
) -> Result<(Vec<u8>, Vec<(u64, String, u16)>), EmitError> {
    let name = function.name();
    let layout_error = |reason: String| EmitError::Layout {
        function: name.to_owned(),
        reason,
    };

    // Pseudo expansion.
    let mut items: Vec<(BlockId, Vec<Item>)> = Vec::with_capacity(function.layout().len());
    for block in function.layout().iter().copied() {
        let mut block_items = Vec::new();
        for inst_id in function.block(block).insts().iter().copied() {
            lower_inst(function.inst(inst_id), &mut block_items)
                .map_err(|reason| layout_error(reason))?;
        }
        items.push((block, block_items));
    }

    // Address assignment.
    let mut block_addresses: BTreeMap<BlockId, u64> = BTreeMap::new();
    let mut address = 0u64;
    for (block, block_items) in items.iter() {
        block_addresses.insert(*block, address);
        for item in block_items.iter() {
            address += item.size(name)?;
        }
    }

    // Encoding and fixups.
    let mut code = Vec::with_capacity(address as usize);
    let mut relocations: Vec<(u64, String, u16)> = Vec::new();
    for (_, block_items) in items.iter() {
        for item in block_items.iter() {
            match item {
                Item::Plain(inst) => {
                    encode(inst, &mut code).map_err(|source| EmitError::Encode {
                        function: name.to_owned(),
                        source,
                    })?;
                }
                Item::PlainReloc {
                    inst,
                    symbol,
                    r_type,
                } => {
                    encode(inst, &mut code).map_err(|source| EmitError::Encode {
                        function: name.to_owned(),
                        source,
                    })?;
                    // The literal is the trailing dword.
                    relocations.push((code.len() as u64 - 4, symbol.clone(), *r_type));
                }
                Item::Branch { opcode, target } => {
                    let pc = code.len() as u64;
                    let target_address = block_addresses[target];
                    let displacement = (target_address as i64 - (pc as i64 + 4)) / 4;
                    let simm16 = i16::try_from(displacement).map_err(|_| {
                        layout_error(format!("branch displacement {displacement} overflows"))
                    })?;
                    encode(
                        &McInst::new(
                            *opcode,
                            vec![McOperand::Immediate(simm16 as u16 as i64)],
                        ),
                        &mut code,
                    )
                    .map_err(|source| EmitError::Encode {
                        function: name.to_owned(),
                        source,
                    })?;
                }
                Item::GlobalAddr { dest, symbol } => {
                    let low = *dest;
                    let high = dest.offset_by(1);
                    encode(
                        &McInst::new(Opcode::SGetpcB64, vec![McOperand::Register(low)]),
                        &mut code,
                    )
                    .map_err(|source| EmitError::Encode {
                        function: name.to_owned(),
                        source,
                    })?;
                    // The literal dwords are the relocation sites.
                    relocations.push((code.len() as u64 + 4, symbol.clone(), R_AMDGPU_REL32_LO));
                    encode(
                        &McInst::new(
                            Opcode::SAddU32,
                            vec![
                                McOperand::Register(low),
                                McOperand::Register(low),
                                McOperand::Immediate(0x7FFF_FFFF),
                            ],
                        ),
                        &mut code,
                    )
                    .map_err(|source| EmitError::Encode {
                        function: name.to_owned(),
                        source,
                    })?;
                    relocations.push((code.len() as u64 + 4, symbol.clone(), R_AMDGPU_REL32_HI));
                    encode(
                        &McInst::new(
                            Opcode::SAddcU32,
                            vec![
                                McOperand::Register(high),
                                McOperand::Register(high),
                                McOperand::Immediate(0x7FFF_FFFF),
                            ],
                        ),
                        &mut code,
                    )
                    .map_err(|source| EmitError::Encode {
                        function: name.to_owned(),
                        source,
                    })?;
                }
            }
        }
    }
    Ok((code, relocations))
}

///
/// Lowers one machine instruction into encodable items.
///
fn lower_inst(inst: &MachineInst, items: &mut Vec<Item>) -> Result<(), String> {
    let physical = |operand: &MachineOperand| -> Result<McOperand, String> {
        match operand {
            MachineOperand::Register {
                register: OperandRegister::Physical(register),
                ..
            } => Ok(McOperand::Register(*register)),
            MachineOperand::Immediate(value) => Ok(McOperand::Immediate(*value)),
            other => Err(format!("operand {other:?} survived to emission")),
        }
    };

    match inst.opcode {
        Opcode::Copy => {
            let dest = match physical(&inst.operands[0])? {
                McOperand::Register(register) => register,
                McOperand::Immediate(_) => return Err("copy into an immediate".to_owned()),
            };
            let source = physical(&inst.operands[1])?;
            let opcode = if dest.is_vgpr() {
                Opcode::VMovB32
            } else if matches!(source, McOperand::Register(from) if from.is_vgpr()) {
                Opcode::VReadfirstlaneB32
            } else {
                Opcode::SMovB32
            };
            items.push(Item::Plain(McInst::new(
                opcode,
                vec![McOperand::Register(dest), source],
            )));
        }
        Opcode::GlobalAddr => {
            let dest = match physical(&inst.operands[0])? {
                McOperand::Register(register) => register,
                McOperand::Immediate(_) => return Err("address into an immediate".to_owned()),
            };
            let symbol = match &inst.operands[1] {
                MachineOperand::Global(symbol) => symbol.clone(),
                other => return Err(format!("GLOBAL_ADDR operand {other:?}")),
            };
            items.push(Item::GlobalAddr { dest, symbol });
        }
        Opcode::InlineAsm => {
            return Err("an inline-asm placeholder survived to emission".to_owned());
        }
        opcode if opcode.is_direct_branch() => {
            match inst.operands.first() {
                Some(MachineOperand::Block(target)) => {
                    items.push(Item::Branch {
                        opcode,
                        target: *target,
                    });
                }
                // A branch lifted with a raw displacement and never
                // re-targeted keeps its field.
                Some(MachineOperand::Immediate(value)) => {
                    items.push(Item::Plain(McInst::new(
                        opcode,
                        vec![McOperand::Immediate(*value)],
                    )));
                }
                other => return Err(format!("branch operand {other:?}")),
            }
        }
        opcode => {
            // A global reference on a plain instruction encodes as a
            // relocated literal.
            let mut relocated: Option<String> = None;
            let mut operands = Vec::with_capacity(inst.operands.len());
            for operand in inst.operands.iter() {
                match operand {
                    MachineOperand::Global(symbol) => {
                        if relocated.replace(symbol.clone()).is_some() {
                            return Err(format!(
                                "two global operands on `{}`",
                                opcode.mnemonic()
                            ));
                        }
                        operands.push(McOperand::Immediate(0x7FFF_FFFF));
                    }
                    other => operands.push(physical(other)?),
                }
            }
            let inst = McInst::new(opcode, operands);
            match relocated {
                Some(symbol) => {
                    let r_type = if opcode == Opcode::SAddcU32 {
                        R_AMDGPU_REL32_HI
                    } else {
                        R_AMDGPU_REL32_LO
                    };
                    items.push(Item::PlainReloc {
                        inst,
                        symbol,
                        r_type,
                    });
                }
                None => items.push(Item::Plain(inst)),
            }
        }
    }
    Ok(())
}

///
/// Emits the code-object form of a tool payload: the serialized hook IR in
/// its own section, the reserved marker variable, a shadow-pointer symbol
/// per hook, and storage for the payload's globals.
///
pub fn emit_payload_object(module: &crate::ir::Module) -> Result<Vec<u8>, EmitError> {
    let mut object = Object::new(
        object::BinaryFormat::Elf,
        object::Architecture::X86_64,
        object::Endianness::Little,
    );

    let payload_section = object.add_section(
        Vec::new(),
        lyra_utils::PAYLOAD_SECTION.as_bytes().to_vec(),
        object::SectionKind::ReadOnlyData,
    );
    let payload = crate::ir::payload::encode_payload(module);
    object.append_section_data(payload_section, payload.as_slice(), 8);

    let data_section =
        object.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
    let bss_section = object.add_section(
        Vec::new(),
        b".bss".to_vec(),
        object::SectionKind::UninitializedData,
    );

    let mut define = |object: &mut Object, name: String, size: u64, align: u64| {
        let offset = object.append_section_bss(bss_section, size, align);
        object.add_symbol(Symbol {
            name: name.into_bytes(),
            value: offset,
            size,
            kind: object::SymbolKind::Data,
            scope: object::SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(bss_section),
            flags: object::SymbolFlags::None,
        });
    };

    define(
        &mut object,
        lyra_utils::TOOL_MARKER_VARIABLE.to_owned(),
        8,
        8,
    );
    for function in module.functions.values().filter(|function| function.is_hook) {
        define(
            &mut object,
            lyra_utils::mangling::mangle_hook_handle(function.name.as_str()),
            8,
            8,
        );
    }
    for global in module.globals.values().filter(|global| !global.is_external) {
        match global.initializer.as_ref() {
            Some(initializer) => {
                let offset = object.append_section_data(
                    data_section,
                    initializer.as_slice(),
                    global.align.max(4),
                );
                object.add_symbol(Symbol {
                    name: global.name.clone().into_bytes(),
                    value: offset,
                    size: global.size,
                    kind: object::SymbolKind::Data,
                    scope: object::SymbolScope::Linkage,
                    weak: false,
                    section: SymbolSection::Section(data_section),
                    flags: object::SymbolFlags::None,
                });
            }
            None => define(
                &mut object,
                global.name.clone(),
                global.size,
                global.align.max(4),
            ),
        }
    }

    let mut bytes = object
        .write()
        .map_err(|error| EmitError::Object(error.to_string()))?;
    patch_machine(&mut bytes);
    Ok(bytes)
}

///
/// Prints the module as textual assembly for diagnostics.
///
pub fn print_assembly(module: &MachineModule) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(4096);
    let _ = writeln!(out, "; module {} ({})", module.name(), module.isa());
    for function in module.functions() {
        let _ = writeln!(out, "\n{}:", function.name());
        for block in function.layout().iter().copied() {
            let _ = writeln!(out, ".LBB{}:", block.index());
            for inst_id in function.block(block).insts().iter().copied() {
                let inst = function.inst(inst_id);
                let _ = write!(out, "    {}", inst.opcode.mnemonic());
                for (index, operand) in inst.operands.iter().enumerate() {
                    let separator = if index == 0 { " " } else { ", " };
                    match operand {
                        MachineOperand::Register {
                            register: OperandRegister::Physical(register),
                            ..
                        } => {
                            let _ = write!(out, "{separator}{register}");
                        }
                        MachineOperand::Register {
                            register: OperandRegister::Virtual(vreg),
                            ..
                        } => {
                            let _ = write!(out, "{separator}{vreg}");
                        }
                        MachineOperand::Immediate(value) => {
                            let _ = write!(out, "{separator}{value:#x}");
                        }
                        MachineOperand::Global(name) => {
                            let _ = write!(out, "{separator}@{name}");
                        }
                        MachineOperand::Block(target) => {
                            let _ = write!(out, "{separator}.LBB{}", target.index());
                        }
                        MachineOperand::AsmIndex(index) => {
                            let _ = write!(out, "{separator}asm#{index}");
                        }
                    }
                }
                let _ = writeln!(out);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use lyra_utils::Isa;
    use object::Object as _;
    use object::ObjectSection as _;
    use object::ObjectSymbol as _;

    use crate::metadata::KernelMetadata;
    use crate::mir::MachineFunction;
    use crate::mir::MachineInst;
    use crate::mir::MachineModule;
    use crate::mir::MachineOperand;
    use crate::target::Register;
    use crate::target::opcode::Opcode;

    use super::EmitGlobal;
    use super::EmitInput;
    use super::emit_relocatable;

    fn kernel_module() -> (MachineModule, Vec<KernelMetadata>) {
        let mut function = MachineFunction::new("k".to_owned(), true);
        let entry = function.create_block();
        let exit = function.create_block();
        function.push_inst(
            entry,
            MachineInst::original(
                Opcode::SMovB32,
                vec![
                    MachineOperand::def_phys(Register::Sgpr(0)),
                    MachineOperand::Immediate(0x10),
                ],
            ),
        );
        function.push_inst(
            entry,
            MachineInst::original(Opcode::SBranch, vec![MachineOperand::Block(exit)]),
        );
        function.push_inst(
            exit,
            MachineInst::original(Opcode::SEndpgm, vec![MachineOperand::Immediate(0)]),
        );
        function.add_successor(entry, exit);

        let mut module = MachineModule::new("fixture".to_owned(), Isa::from_processor("gfx908"));
        module.add_function(function);
        let metadata = KernelMetadata {
            symbol: "k".to_owned(),
            kernarg_segment_size: 0,
            kernarg_segment_align: 8,
            group_segment_fixed_size: 0,
            private_segment_fixed_size: 0,
            sgpr_count: 16,
            vgpr_count: 4,
            user_sgpr_count: 2,
            args: Vec::new(),
        };
        (module, vec![metadata])
    }

    #[test]
    fn emits_a_parsable_object_with_kernel_symbols() {
        let (module, kernels) = kernel_module();
        let globals = vec![EmitGlobal {
            name: "counter".to_owned(),
            size: 4,
            align: 4,
            initializer: None,
            is_external: false,
        }];
        let bytes = emit_relocatable(&EmitInput {
            module: &module,
            kernels: kernels.as_slice(),
            globals: globals.as_slice(),
        })
        .expect("Always valid");

        // The machine number is stamped over the writer's generic one.
        assert_eq!(u16::from_le_bytes([bytes[18], bytes[19]]), 224);

        let file = object::File::parse(bytes.as_slice()).expect("Always valid");
        let names: Vec<String> = file
            .symbols()
            .filter_map(|symbol| symbol.name().ok().map(str::to_owned))
            .collect();
        assert!(names.contains(&"k".to_owned()));
        assert!(names.contains(&"k.kd".to_owned()));
        assert!(names.contains(&"counter".to_owned()));

        let text = file.section_by_name(".text").expect("Always exists");
        let code = text.data().expect("Always valid");
        // s_mov(+literal) + s_branch + s_endpgm.
        assert_eq!(code.len(), 16);
    }
}
