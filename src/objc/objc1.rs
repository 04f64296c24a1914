//! ObjC1 ("legacy") runtime metadata parsing.
//!
//! Only ever shipped on 32-bit architectures; this crate parses it purely
//! for 32-bit ARM images built against old enough SDKs to still use it.
//! `__OBJC,__module_info` holds an array of `objc_module` records, each
//! pointing at one `objc_symtab` listing that compilation unit's classes.
//!
//! Uses the same read-through-a-memory-view pattern as [`super::objc2`],
//! simplified here since the legacy format has no realized/unrealized
//! class distinction to resolve.

use super::ObjcError;
use crate::mobject::MemoryObject;
use std::ffi::CStr;

#[repr(C)]
struct ObjcModule {
    version: u32,
    size: u32,
    name: u32,
    symtab: u32,
}

#[repr(C)]
struct ObjcSymtab {
    sel_ref_cnt: u32,
    refs: u32,
    cls_def_cnt: u16,
    cat_def_cnt: u16,
}

#[repr(C)]
struct ObjcClass {
    isa: u32,
    super_class: u32,
    name: u32,
    version: u32,
    info: u32,
    instance_size: i32,
    ivars: u32,
    method_lists: u32,
    cache: u32,
    protocols: u32,
}

/// Set in `objc_class.info` when `method_lists` points directly at a
/// single `objc_method_list`, rather than at an array of pointers to one.
const CLS_NO_METHOD_ARRAY: u32 = 0x4000;
/// Terminates an array-of-method-lists; either a NUL entry or this
/// sentinel ends the walk.
const METHOD_LIST_ARRAY_END: u32 = 0xFFFF_FFFF;

#[repr(C)]
struct ObjcMethodListHeader {
    obsolete: u32,
    method_count: i32,
}

#[repr(C)]
struct ObjcMethod {
    name: u32,
    types: u32,
    imp: u32,
}

pub struct ParsedMethod {
    pub name: String,
    pub imp: u64,
}

pub struct ParsedClass {
    pub name: String,
    pub methods: Vec<ParsedMethod>,
}

fn read<T: Copy>(memory: &MemoryObject, addr: u64) -> Result<T, ObjcError> {
    let offset = addr
        .checked_sub(memory.task_address())
        .ok_or(ObjcError::OutOfRange)?;
    let bytes = memory
        .translate_slice(offset, std::mem::size_of::<T>() as u64)
        .ok_or(ObjcError::OutOfRange)?;
    // SAFETY: `bytes` is exactly `size_of::<T>()` long; every `T` passed
    // here is a `#[repr(C)]` POD struct of `u32`-sized fields, matching the
    // 32-bit-only legacy ABI this module parses.
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}

fn read_cstring(memory: &MemoryObject, addr: u32, max_len: usize) -> Result<String, ObjcError> {
    let offset = (addr as u64)
        .checked_sub(memory.task_address())
        .ok_or(ObjcError::OutOfRange)?;
    let bytes = memory
        .translate_slice(offset, max_len as u64)
        .ok_or(ObjcError::OutOfRange)?;
    let cstr = CStr::from_bytes_until_nul(bytes).map_err(|_| ObjcError::MalformedString)?;
    Ok(cstr.to_string_lossy().into_owned())
}

fn parse_method_list(memory: &MemoryObject, list_addr: u32) -> Result<Vec<ParsedMethod>, ObjcError> {
    if list_addr == 0 {
        return Ok(Vec::new());
    }
    let header: ObjcMethodListHeader = read(memory, list_addr as u64)?;
    if header.method_count <= 0 {
        return Ok(Vec::new());
    }

    let entry_base = list_addr as u64 + std::mem::size_of::<ObjcMethodListHeader>() as u64;
    let mut methods = Vec::with_capacity(header.method_count as usize);
    for i in 0..header.method_count as u64 {
        let entry_addr = entry_base + i * std::mem::size_of::<ObjcMethod>() as u64;
        let method: ObjcMethod = read(memory, entry_addr)?;
        if method.imp == 0 {
            continue;
        }
        let name =
            read_cstring(memory, method.name, 512).unwrap_or_else(|_| "<unknown>".into());
        methods.push(ParsedMethod {
            name,
            imp: method.imp as u64,
        });
    }
    Ok(methods)
}

/// Parses `methodLists`, handling both legacy shapes: a single list
/// (`CLS_NO_METHOD_ARRAY` set, the common case for compiler-emitted
/// classes) or an array of list pointers terminated by a NUL or
/// [`METHOD_LIST_ARRAY_END`] entry (categories can attach additional
/// lists this way). One malformed list in an array doesn't sink the
/// others; it's skipped and the walk continues.
fn parse_class_method_lists(
    memory: &MemoryObject,
    class: &ObjcClass,
) -> Result<Vec<ParsedMethod>, ObjcError> {
    if class.method_lists == 0 {
        return Ok(Vec::new());
    }
    if class.info & CLS_NO_METHOD_ARRAY != 0 {
        return parse_method_list(memory, class.method_lists);
    }

    let mut methods = Vec::new();
    let mut cursor = class.method_lists as u64;
    loop {
        let entry: u32 = read(memory, cursor)?;
        if entry == 0 || entry == METHOD_LIST_ARRAY_END {
            break;
        }
        if let Ok(list) = parse_method_list(memory, entry) {
            methods.extend(list);
        }
        cursor += std::mem::size_of::<u32>() as u64;
    }
    Ok(methods)
}

/// Parses one legacy class record, including its full method set.
pub fn parse_class(memory: &MemoryObject, class_addr: u32) -> Result<ParsedClass, ObjcError> {
    let class: ObjcClass = read(memory, class_addr as u64)?;
    let name = read_cstring(memory, class.name, 512)?;
    let methods = parse_class_method_lists(memory, &class).unwrap_or_default();
    Ok(ParsedClass { name, methods })
}

/// Walks `__OBJC,__module_info`, yielding every class address referenced
/// by any module's symbol table.
pub fn enumerate_classes(
    memory: &MemoryObject,
    module_info_addr: u64,
    module_info_size: u64,
) -> Result<Vec<u32>, ObjcError> {
    let mut classes = Vec::new();
    let module_size = std::mem::size_of::<ObjcModule>() as u64;
    let mut cursor = module_info_addr;
    let end = module_info_addr + module_info_size;

    while cursor + module_size <= end {
        let module: ObjcModule = read(memory, cursor)?;
        if module.symtab != 0 {
            let symtab: ObjcSymtab = read(memory, module.symtab as u64)?;
            let defs_base = module.symtab as u64 + std::mem::size_of::<ObjcSymtab>() as u64;
            for i in 0..symtab.cls_def_cnt as u64 {
                let ptr: u32 = read(memory, defs_base + i * 4)?;
                classes.push(ptr);
            }
        }
        cursor += module_size;
    }

    Ok(classes)
}
