//!
//! Kernel metadata and kernel descriptors.
//!

use lyra_utils::METADATA_NOTE_NAME;
use lyra_utils::METADATA_NOTE_TYPE;

///
/// The kind of one kernel argument.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KernelArgKind {
    /// A value passed directly in the kernarg segment.
    ByValue,
    /// A pointer to a global buffer.
    GlobalBuffer,
    /// The hidden global offset along X.
    HiddenGlobalOffsetX,
    /// The hidden global offset along Y.
    HiddenGlobalOffsetY,
    /// The hidden global offset along Z.
    HiddenGlobalOffsetZ,
    /// The hidden pointer to the implicit-argument block.
    HiddenImplicitArgPtr,
}

impl KernelArgKind {
    ///
    /// Whether the argument is hidden from the language signature.
    ///
    pub fn is_hidden(&self) -> bool {
        !matches!(self, KernelArgKind::ByValue | KernelArgKind::GlobalBuffer)
    }
}

///
/// One kernel argument slot.
///
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KernelArgument {
    /// The source-level name, absent for hidden arguments.
    pub name: Option<String>,
    /// The byte offset inside the kernarg segment.
    pub offset: u32,
    /// The byte size.
    pub size: u32,
    /// The argument kind.
    pub kind: KernelArgKind,
}

///
/// Parsed metadata of one kernel.
///
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KernelMetadata {
    /// The kernel symbol name, without the descriptor suffix.
    pub symbol: String,
    /// The kernarg segment size in bytes.
    pub kernarg_segment_size: u32,
    /// The kernarg segment alignment in bytes.
    pub kernarg_segment_align: u32,
    /// The group (LDS) segment size in bytes.
    pub group_segment_fixed_size: u32,
    /// The private (scratch) segment size in bytes per work-item.
    pub private_segment_fixed_size: u32,
    /// The number of scalar registers the kernel requests.
    pub sgpr_count: u16,
    /// The number of vector registers the kernel requests.
    pub vgpr_count: u16,
    /// The number of user SGPRs preloaded by the hardware, kernarg pointer
    /// included.
    pub user_sgpr_count: u16,
    /// The argument layout.
    pub args: Vec<KernelArgument>,
}

impl KernelMetadata {
    ///
    /// The descriptor symbol name of this kernel.
    ///
    pub fn descriptor_symbol(&self) -> String {
        format!("{}.kd", self.symbol)
    }

    ///
    /// Finds the first argument of a kind.
    ///
    pub fn argument_of_kind(&self, kind: KernelArgKind) -> Option<&KernelArgument> {
        self.args.iter().find(|argument| argument.kind == kind)
    }
}

///
/// The 64-byte kernel descriptor preceding a kernel's code.
///
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KernelDescriptor {
    /// The group segment size in bytes.
    pub group_segment_fixed_size: u32,
    /// The private segment size in bytes per work-item.
    pub private_segment_fixed_size: u32,
    /// The kernarg segment size in bytes.
    pub kernarg_size: u32,
    /// The byte offset from the descriptor to the kernel's first
    /// instruction.
    pub kernel_code_entry_byte_offset: i64,
    /// The number of vector registers to allocate.
    pub vgpr_count: u16,
    /// The number of scalar registers to allocate.
    pub sgpr_count: u16,
    /// The number of user SGPRs the hardware preloads.
    pub user_sgpr_count: u16,
    /// Whether the wave needs a private segment set up.
    pub enables_private_segment: bool,
}

impl KernelDescriptor {
    /// The descriptor size in bytes.
    pub const SIZE: usize = 64;

    ///
    /// Packs the descriptor into its 64-byte form.
    ///
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.group_segment_fixed_size.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.private_segment_fixed_size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.kernarg_size.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.kernel_code_entry_byte_offset.to_le_bytes());

        let granulated_vgprs = u32::from(if self.vgpr_count == 0 {
            0
        } else {
            (self.vgpr_count + 3) / 4 - 1
        });
        let granulated_sgprs = u32::from(if self.sgpr_count == 0 {
            0
        } else {
            (self.sgpr_count + 7) / 8 - 1
        });
        let rsrc1 = granulated_vgprs | (granulated_sgprs << 6);
        bytes[48..52].copy_from_slice(&rsrc1.to_le_bytes());

        let rsrc2 =
            (self.enables_private_segment as u32) | ((self.user_sgpr_count as u32 & 0x1F) << 1);
        bytes[52..56].copy_from_slice(&rsrc2.to_le_bytes());
        bytes
    }

    ///
    /// Unpacks a descriptor from its 64-byte form.
    ///
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let word = |range: std::ops::Range<usize>| {
            u32::from_le_bytes(bytes[range].try_into().expect("Range is four bytes"))
        };
        let rsrc1 = word(48..52);
        let rsrc2 = word(52..56);
        Some(Self {
            group_segment_fixed_size: word(0..4),
            private_segment_fixed_size: word(4..8),
            kernarg_size: word(8..12),
            kernel_code_entry_byte_offset: i64::from_le_bytes(
                bytes[16..24].try_into().expect("Range is eight bytes"),
            ),
            vgpr_count: (((rsrc1 & 0x3F) + 1) * 4) as u16,
            sgpr_count: ((((rsrc1 >> 6) & 0xF) + 1) * 8) as u16,
            user_sgpr_count: ((rsrc2 >> 1) & 0x1F) as u16,
            enables_private_segment: rsrc2 & 1 != 0,
        })
    }
}

///
/// Encodes the metadata note section contents: a standard ELF note record
/// whose descriptor is the CBOR-encoded metadata list.
///
pub fn encode_metadata_note(kernels: &[KernelMetadata]) -> Vec<u8> {
    let mut desc = Vec::with_capacity(512);
    ciborium::into_writer(&kernels, &mut desc).expect("CBOR writing to a vector cannot fail");

    let name = METADATA_NOTE_NAME.as_bytes();
    let mut note = Vec::with_capacity(16 + name.len() + desc.len() + 8);
    note.extend_from_slice(&(name.len() as u32 + 1).to_le_bytes());
    note.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    note.extend_from_slice(&METADATA_NOTE_TYPE.to_le_bytes());
    note.extend_from_slice(name);
    note.push(0);
    while note.len() % 4 != 0 {
        note.push(0);
    }
    note.extend_from_slice(desc.as_slice());
    note
}

///
/// Parses the metadata note section contents.
///
pub fn parse_metadata_note(section: &[u8]) -> anyhow::Result<Vec<KernelMetadata>> {
    if section.len() < 12 {
        anyhow::bail!("metadata note shorter than its header");
    }
    let name_size = u32::from_le_bytes(section[0..4].try_into()?) as usize;
    let desc_size = u32::from_le_bytes(section[4..8].try_into()?) as usize;
    let note_type = u32::from_le_bytes(section[8..12].try_into()?);
    if note_type != METADATA_NOTE_TYPE {
        anyhow::bail!("unexpected note type {note_type}");
    }
    let name_end = 12 + name_size;
    let name = section
        .get(12..name_end.saturating_sub(1))
        .ok_or_else(|| anyhow::anyhow!("truncated note name"))?;
    if name != METADATA_NOTE_NAME.as_bytes() {
        anyhow::bail!("unexpected note name");
    }
    let desc_start = (name_end + 3) & !3;
    let desc = section
        .get(desc_start..desc_start + desc_size)
        .ok_or_else(|| anyhow::anyhow!("truncated note descriptor"))?;
    ciborium::from_reader(desc).map_err(|error| anyhow::anyhow!("metadata body: {error}"))
}

#[cfg(test)]
mod tests {
    use super::KernelArgKind;
    use super::KernelArgument;
    use super::KernelDescriptor;
    use super::KernelMetadata;
    use super::encode_metadata_note;
    use super::parse_metadata_note;

    fn metadata() -> KernelMetadata {
        KernelMetadata {
            symbol: "vector_add".to_owned(),
            kernarg_segment_size: 24,
            kernarg_segment_align: 8,
            group_segment_fixed_size: 0,
            private_segment_fixed_size: 16,
            sgpr_count: 16,
            vgpr_count: 8,
            user_sgpr_count: 4,
            args: vec![KernelArgument {
                name: Some("out".to_owned()),
                offset: 0,
                size: 8,
                kind: KernelArgKind::GlobalBuffer,
            }],
        }
    }

    #[test]
    fn descriptor_round_trip() {
        let descriptor = KernelDescriptor {
            group_segment_fixed_size: 0,
            private_segment_fixed_size: 16,
            kernarg_size: 24,
            kernel_code_entry_byte_offset: 256,
            vgpr_count: 8,
            sgpr_count: 16,
            user_sgpr_count: 4,
            enables_private_segment: true,
        };
        let unpacked =
            KernelDescriptor::from_bytes(&descriptor.to_bytes()).expect("Always valid");
        assert_eq!(unpacked, descriptor);
    }

    #[test]
    fn note_round_trip() {
        let note = encode_metadata_note(&[metadata()]);
        let parsed = parse_metadata_note(note.as_slice()).expect("Always valid");
        assert_eq!(parsed, vec![metadata()]);
    }

    #[test]
    fn descriptor_symbol_name() {
        assert_eq!(metadata().descriptor_symbol(), "vector_add.kd");
    }
}
