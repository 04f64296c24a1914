//! Mach-O load command reader.
//!
//! Walks the load commands that follow a Mach-O header to answer two
//! questions the rest of the crate needs answered without allocating:
//! "where is section X mapped" and "what is this image's `__TEXT` slide".
//! Every read goes through a [`MemoryObject`], so this works identically
//! whether the header lives in our own address space or a crashed task's.
//!
//! Generalizes the classic "hardcoded 64-bit, stop at the first `__TEXT`
//! segment" load-command walk into "32- or 64-bit, index every section by
//! name", since the ObjC parser needs arbitrary `__DATA`/`__TEXT`
//! sections, not just the image bounds.

use crate::error::MachOError;
use crate::image::{ByteOrder, PointerWidth};
use crate::mobject::MemoryObject;

const MH_MAGIC: u32 = 0xfeedface;
const MH_MAGIC_64: u32 = 0xfeedfacf;
const MH_CIGAM: u32 = 0xcefaedfe;
const MH_CIGAM_64: u32 = 0xcffaedfe;

const LC_SEGMENT: u32 = 0x1;
const LC_SEGMENT_64: u32 = 0x19;
const LC_UUID: u32 = 0x1b;

/// Location of one named section within the image, in image-relative file
/// offsets (i.e. not yet slid).
#[derive(Debug, Clone, Copy)]
pub struct SectionInfo {
    pub addr: u64,
    pub size: u64,
}

/// Parsed view of a single Mach-O image's load commands.
pub struct MachOReader {
    byte_order: ByteOrder,
    pointer_width: PointerWidth,
    text_vmaddr: u64,
    text_vmsize: u64,
    uuid: Option<[u8; 16]>,
    sections: Vec<(String, String, SectionInfo)>,
}

#[repr(C)]
struct MachHeader32 {
    magic: u32,
    cpu_type: i32,
    cpu_sub_type: i32,
    file_type: u32,
    num_commands: u32,
    size_commands: u32,
    flags: u32,
}

#[repr(C)]
struct MachHeader64 {
    magic: u32,
    cpu_type: i32,
    cpu_sub_type: i32,
    file_type: u32,
    num_commands: u32,
    size_commands: u32,
    flags: u32,
    _reserved: u32,
}

#[repr(C)]
struct LoadCommand {
    cmd: u32,
    cmd_size: u32,
}

#[repr(C)]
struct SegmentCommand32 {
    cmd: u32,
    cmd_size: u32,
    segment_name: [u8; 16],
    vm_addr: u32,
    vm_size: u32,
    file_off: u32,
    file_size: u32,
    max_prot: i32,
    init_prot: i32,
    num_sections: u32,
    flags: u32,
}

#[repr(C)]
struct Section32 {
    sect_name: [u8; 16],
    seg_name: [u8; 16],
    addr: u32,
    size: u32,
    _offset: u32,
    _align: u32,
    _reloff: u32,
    _nreloc: u32,
    _flags: u32,
    _reserved1: u32,
    _reserved2: u32,
}

#[repr(C)]
struct SegmentCommand64 {
    cmd: u32,
    cmd_size: u32,
    segment_name: [u8; 16],
    vm_addr: u64,
    vm_size: u64,
    file_off: u64,
    file_size: u64,
    max_prot: i32,
    init_prot: i32,
    num_sections: u32,
    flags: u32,
}

#[repr(C)]
struct Section64 {
    sect_name: [u8; 16],
    seg_name: [u8; 16],
    addr: u64,
    size: u64,
    _offset: u32,
    _align: u32,
    _reloff: u32,
    _nreloc: u32,
    _flags: u32,
    _reserved1: u32,
    _reserved2: u32,
    _reserved3: u32,
}

#[repr(C)]
struct UuidCommand {
    cmd: u32,
    cmd_size: u32,
    uuid: [u8; 16],
}

fn cstr16(raw: &[u8; 16]) -> String {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(16);
    String::from_utf8_lossy(&raw[..len]).into_owned()
}

impl MachOReader {
    /// Parses the load commands at `base` in `mobject`'s view. `base` is an
    /// offset into the memory object, not an absolute address.
    pub fn parse(mobject: &MemoryObject, base: u64) -> Result<Self, MachOError> {
        let magic_bytes = mobject
            .translate_slice(base, 4)
            .ok_or(MachOError::Mobject(crate::error::MobjectError::NotFound))?;
        let magic = u32::from_ne_bytes(magic_bytes.try_into().unwrap());

        let (pointer_width, byte_order) = match magic {
            MH_MAGIC_64 => (PointerWidth::Bits64, ByteOrder::Little),
            MH_MAGIC => (PointerWidth::Bits32, ByteOrder::Little),
            MH_CIGAM_64 => (PointerWidth::Bits64, ByteOrder::Big),
            MH_CIGAM => (PointerWidth::Bits32, ByteOrder::Big),
            _ => return Err(MachOError::InvalidMagic),
        };

        if byte_order == ByteOrder::Big {
            // Every architecture this crate supports (x86/x86_64/armv7) is
            // little-endian; a big-endian magic means the header is either
            // corrupt or foreign, and there is nothing useful to do with it.
            return Err(MachOError::InvalidMagic);
        }

        let (num_commands, size_commands, header_size) = match pointer_width {
            PointerWidth::Bits64 => {
                let bytes = mobject
                    .translate_slice(base, std::mem::size_of::<MachHeader64>() as u64)
                    .ok_or(MachOError::TruncatedLoadCommands)?;
                // SAFETY: `bytes` is exactly `size_of::<MachHeader64>()`
                // long and was just validated by `translate_slice`.
                let header = unsafe { &*(bytes.as_ptr().cast::<MachHeader64>()) };
                (
                    header.num_commands,
                    header.size_commands,
                    std::mem::size_of::<MachHeader64>(),
                )
            }
            PointerWidth::Bits32 => {
                let bytes = mobject
                    .translate_slice(base, std::mem::size_of::<MachHeader32>() as u64)
                    .ok_or(MachOError::TruncatedLoadCommands)?;
                // SAFETY: same as above, 32-bit header.
                let header = unsafe { &*(bytes.as_ptr().cast::<MachHeader32>()) };
                (
                    header.num_commands,
                    header.size_commands,
                    std::mem::size_of::<MachHeader32>(),
                )
            }
        };

        let commands_bytes = mobject
            .translate_slice(base + header_size as u64, size_commands as u64)
            .ok_or(MachOError::TruncatedLoadCommands)?;

        let mut sections = Vec::new();
        let mut text_vmaddr = 0;
        let mut text_vmsize = 0;
        let mut uuid = None;
        let mut cursor = 0usize;

        for _ in 0..num_commands {
            if cursor + std::mem::size_of::<LoadCommand>() > commands_bytes.len() {
                return Err(MachOError::TruncatedLoadCommands);
            }
            // SAFETY: bounds checked above.
            let lc = unsafe {
                &*(commands_bytes[cursor..].as_ptr().cast::<LoadCommand>())
            };
            let cmd_size = lc.cmd_size as usize;
            if cmd_size < std::mem::size_of::<LoadCommand>()
                || cursor + cmd_size > commands_bytes.len()
            {
                return Err(MachOError::TruncatedLoadCommands);
            }

            match (lc.cmd, pointer_width) {
                (LC_SEGMENT_64, PointerWidth::Bits64) => {
                    // SAFETY: `cmd_size` covers at least `SegmentCommand64`
                    // for a well-formed LC_SEGMENT_64, checked above.
                    let seg = unsafe {
                        &*(commands_bytes[cursor..].as_ptr().cast::<SegmentCommand64>())
                    };
                    let seg_name = cstr16(&seg.segment_name);
                    if seg_name == "__TEXT" {
                        text_vmaddr = seg.vm_addr;
                        text_vmsize = seg.vm_size;
                    }
                    let sect_base = cursor + std::mem::size_of::<SegmentCommand64>();
                    for s in 0..seg.num_sections as usize {
                        let off = sect_base + s * std::mem::size_of::<Section64>();
                        if off + std::mem::size_of::<Section64>() > commands_bytes.len() {
                            break;
                        }
                        // SAFETY: bounds checked in the `if` above.
                        let section = unsafe {
                            &*(commands_bytes[off..].as_ptr().cast::<Section64>())
                        };
                        sections.push((
                            cstr16(&section.seg_name),
                            cstr16(&section.sect_name),
                            SectionInfo {
                                addr: section.addr,
                                size: section.size,
                            },
                        ));
                    }
                }
                (LC_SEGMENT, PointerWidth::Bits32) => {
                    // SAFETY: `cmd_size` covers at least `SegmentCommand32`
                    // for a well-formed LC_SEGMENT, checked above.
                    let seg = unsafe {
                        &*(commands_bytes[cursor..].as_ptr().cast::<SegmentCommand32>())
                    };
                    let seg_name = cstr16(&seg.segment_name);
                    if seg_name == "__TEXT" {
                        text_vmaddr = seg.vm_addr as u64;
                        text_vmsize = seg.vm_size as u64;
                    }
                    let sect_base = cursor + std::mem::size_of::<SegmentCommand32>();
                    for s in 0..seg.num_sections as usize {
                        let off = sect_base + s * std::mem::size_of::<Section32>();
                        if off + std::mem::size_of::<Section32>() > commands_bytes.len() {
                            break;
                        }
                        // SAFETY: bounds checked in the `if` above.
                        let section = unsafe {
                            &*(commands_bytes[off..].as_ptr().cast::<Section32>())
                        };
                        sections.push((
                            cstr16(&section.seg_name),
                            cstr16(&section.sect_name),
                            SectionInfo {
                                addr: section.addr as u64,
                                size: section.size as u64,
                            },
                        ));
                    }
                }
                (LC_UUID, _) => {
                    if cmd_size >= std::mem::size_of::<UuidCommand>() {
                        // SAFETY: size checked above.
                        let cmd = unsafe {
                            &*(commands_bytes[cursor..].as_ptr().cast::<UuidCommand>())
                        };
                        uuid = Some(cmd.uuid);
                    }
                }
                _ => {}
            }

            cursor += cmd_size;
        }

        Ok(Self {
            byte_order,
            pointer_width,
            text_vmaddr,
            text_vmsize,
            uuid,
            sections,
        })
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn pointer_width(&self) -> PointerWidth {
        self.pointer_width
    }

    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.uuid
    }

    /// The `__TEXT` segment's unslid virtual size, i.e. this image's extent.
    pub fn text_size(&self) -> u64 {
        self.text_vmsize
    }

    pub fn text_vmaddr(&self) -> u64 {
        self.text_vmaddr
    }

    /// Looks up a section by segment/section name, e.g. `("__DATA",
    /// "__objc_data")`.
    pub fn map_section(&self, segment: &str, section: &str) -> Result<SectionInfo, MachOError> {
        self.sections
            .iter()
            .find(|(seg, sect, _)| seg == segment && sect == section)
            .map(|(_, _, info)| *info)
            .ok_or_else(|| MachOError::SectionNotFound {
                segment: segment.to_string(),
                section: section.to_string(),
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn push_header64(buf: &mut Vec<u8>, num_commands: u32, size_commands: u32) {
        buf.extend_from_slice(&MH_MAGIC_64.to_ne_bytes());
        buf.extend_from_slice(&0i32.to_ne_bytes()); // cpu_type
        buf.extend_from_slice(&0i32.to_ne_bytes()); // cpu_sub_type
        buf.extend_from_slice(&0u32.to_ne_bytes()); // file_type
        buf.extend_from_slice(&num_commands.to_ne_bytes());
        buf.extend_from_slice(&size_commands.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // flags
        buf.extend_from_slice(&0u32.to_ne_bytes()); // reserved
    }

    fn segment_name(name: &str) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        buf
    }

    fn build_fake_image() -> Vec<u8> {
        let mut cmds = Vec::new();
        // __TEXT segment, no sections.
        cmds.extend_from_slice(&LC_SEGMENT_64.to_ne_bytes());
        let seg_cmd_size = std::mem::size_of::<SegmentCommand64>() as u32;
        cmds.extend_from_slice(&seg_cmd_size.to_ne_bytes());
        cmds.extend_from_slice(&segment_name("__TEXT"));
        cmds.extend_from_slice(&0x1000u64.to_ne_bytes()); // vm_addr
        cmds.extend_from_slice(&0x4000u64.to_ne_bytes()); // vm_size
        cmds.extend_from_slice(&0u64.to_ne_bytes()); // file_off
        cmds.extend_from_slice(&0u64.to_ne_bytes()); // file_size
        cmds.extend_from_slice(&0i32.to_ne_bytes()); // max_prot
        cmds.extend_from_slice(&0i32.to_ne_bytes()); // init_prot
        cmds.extend_from_slice(&0u32.to_ne_bytes()); // num_sections
        cmds.extend_from_slice(&0u32.to_ne_bytes()); // flags

        // UUID
        cmds.extend_from_slice(&LC_UUID.to_ne_bytes());
        let uuid_cmd_size = std::mem::size_of::<UuidCommand>() as u32;
        cmds.extend_from_slice(&uuid_cmd_size.to_ne_bytes());
        cmds.extend_from_slice(&[0xab; 16]);

        let mut buf = Vec::new();
        push_header64(&mut buf, 2, cmds.len() as u32);
        buf.extend_from_slice(&cmds);
        buf
    }

    #[test]
    fn parses_text_segment_and_uuid() {
        let image = build_fake_image();
        let addr = image.as_ptr() as u64;
        let mobject = MemoryObject::for_self(addr, image.len() as u64).unwrap();

        let reader = MachOReader::parse(&mobject, 0).unwrap();
        assert_eq!(reader.pointer_width(), PointerWidth::Bits64);
        assert_eq!(reader.text_vmaddr(), 0x1000);
        assert_eq!(reader.text_size(), 0x4000);
        assert_eq!(reader.uuid(), Some([0xab; 16]));
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 32];
        let addr = buf.as_ptr() as u64;
        let mobject = MemoryObject::for_self(addr, buf.len() as u64).unwrap();
        assert!(matches!(
            MachOReader::parse(&mobject, 0),
            Err(MachOError::InvalidMagic)
        ));
    }

    #[test]
    fn missing_section_is_reported_by_name() {
        let image = build_fake_image();
        let addr = image.as_ptr() as u64;
        let mobject = MemoryObject::for_self(addr, image.len() as u64).unwrap();
        let reader = MachOReader::parse(&mobject, 0).unwrap();

        match reader.map_section("__DATA", "__objc_data") {
            Err(MachOError::SectionNotFound { segment, section }) => {
                assert_eq!(segment, "__DATA");
                assert_eq!(section, "__objc_data");
            }
            other => panic!("expected SectionNotFound, got {other:?}"),
        }
    }
}
