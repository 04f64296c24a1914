//! ObjC2 ("modern") runtime metadata parsing.
//!
//! Covers every architecture this crate supports (32/64-bit x86, 32-bit
//! ARM never shipped the legacy runtime past its earliest iOS releases,
//! and is handled by [`super::objc1`] only for completeness on that one
//! architecture). Only the absolute-pointer `method_t` layout is
//! implemented -- the relative-pointer ("small") method list format exists
//! solely to support arm64e, which is out of scope.
//!
//! Reads through a small set of typed helpers rather than copying bytes
//! out, the same "walk a struct directly over a memory view" shape as
//! ELF section/symtab walking, adapted to class-list/class_ro_t/
//! method_list_t walking.

use super::ObjcError;
use crate::mobject::MemoryObject;
use std::ffi::CStr;

const RW_REALIZED: u32 = 0x8000_0000;

#[repr(C)]
struct ClassT {
    isa: u64,
    superclass: u64,
    cache: u64,
    vtable: u64,
    data: u64,
}

#[repr(C)]
struct ClassRwT {
    flags: u32,
    witness: u32,
    ro_or_rwe: u64,
}

#[repr(C)]
struct ClassRoT {
    flags: u32,
    instance_start: u32,
    instance_size: u32,
    _reserved: u32,
    ivar_layout: u64,
    name: u64,
    base_method_list: u64,
    base_protocols: u64,
    ivars: u64,
    weak_ivar_layout: u64,
    base_properties: u64,
}

#[repr(C)]
struct MethodListHeader {
    entsize_and_flags: u32,
    count: u32,
}

#[repr(C)]
struct MethodT {
    name: u64,
    types: u64,
    imp: u64,
}

const METHOD_LIST_FLAG_SMALL: u32 = 0x8000_0000;

pub struct ParsedMethod {
    pub name: String,
    pub imp: u64,
}

fn read<T: Copy>(memory: &MemoryObject, addr: u64) -> Result<T, ObjcError> {
    let offset = addr
        .checked_sub(memory.task_address())
        .ok_or(ObjcError::OutOfRange)?;
    let bytes = memory
        .translate_slice(offset, std::mem::size_of::<T>() as u64)
        .ok_or(ObjcError::OutOfRange)?;
    // SAFETY: `bytes` is exactly `size_of::<T>()` long; every `T` passed
    // here is a `#[repr(C)]` POD struct of fixed-width integers.
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}

fn read_cstring(memory: &MemoryObject, addr: u64, max_len: usize) -> Result<String, ObjcError> {
    let offset = addr
        .checked_sub(memory.task_address())
        .ok_or(ObjcError::OutOfRange)?;
    let bytes = memory
        .translate_slice(offset, max_len as u64)
        .ok_or(ObjcError::OutOfRange)?;
    let cstr = CStr::from_bytes_until_nul(bytes).map_err(|_| ObjcError::MalformedString)?;
    Ok(cstr.to_string_lossy().into_owned())
}

/// Resolves a `class_t.data` field (masked of its low tag bits by the
/// caller) down to the `class_ro_t` it ultimately describes, whether the
/// class has been realized into a `class_rw_t` yet or not.
fn resolve_ro_addr(memory: &MemoryObject, data_addr: u64) -> Result<u64, ObjcError> {
    let probe_flags: u32 = read(memory, data_addr)?;
    if probe_flags & RW_REALIZED != 0 {
        let rw: ClassRwT = read(memory, data_addr)?;
        Ok(rw.ro_or_rwe)
    } else {
        Ok(data_addr)
    }
}

pub struct ParsedClass {
    pub name: String,
    pub methods: Vec<ParsedMethod>,
}

fn parse_method_list(memory: &MemoryObject, list_addr: u64) -> Result<Vec<ParsedMethod>, ObjcError> {
    if list_addr == 0 {
        return Ok(Vec::new());
    }
    let header: MethodListHeader = read(memory, list_addr)?;
    if header.entsize_and_flags & METHOD_LIST_FLAG_SMALL != 0 {
        // Relative (arm64e-only) method lists are out of scope.
        return Ok(Vec::new());
    }

    let entry_base = list_addr + std::mem::size_of::<MethodListHeader>() as u64;
    let mut methods = Vec::with_capacity(header.count as usize);
    for i in 0..header.count as u64 {
        let entry_addr = entry_base + i * std::mem::size_of::<MethodT>() as u64;
        let method: MethodT = read(memory, entry_addr)?;
        if method.imp == 0 {
            continue;
        }
        let name = read_cstring(memory, method.name, 512).unwrap_or_else(|_| "<unknown>".into());
        methods.push(ParsedMethod { name, imp: method.imp });
    }
    Ok(methods)
}

/// Parses one class (its name plus its own, non-inherited, method list).
/// `class_addr` is the address of the `class_t` struct; pass the
/// metaclass address instead to get class (static) methods.
pub fn parse_class(memory: &MemoryObject, class_addr: u64) -> Result<ParsedClass, ObjcError> {
    let class: ClassT = read(memory, class_addr)?;
    const FAST_DATA_MASK: u64 = !0x7;
    let ro_addr = resolve_ro_addr(memory, class.data & FAST_DATA_MASK)?;
    let ro: ClassRoT = read(memory, ro_addr)?;
    let name = read_cstring(memory, ro.name, 512)?;
    let methods = parse_method_list(memory, ro.base_method_list)?;
    Ok(ParsedClass { name, methods })
}

/// Enumerates the class pointers in an image's `__objc_classlist` section.
pub fn iter_classlist(
    memory: &MemoryObject,
    classlist_addr: u64,
    count: u64,
) -> Result<Vec<u64>, ObjcError> {
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        let ptr: u64 = read(memory, classlist_addr + i * 8)?;
        out.push(ptr);
    }
    Ok(out)
}

/// Returns this class's metaclass address (`isa` of the class itself),
/// whose own method list holds the class's static methods.
pub fn metaclass_of(memory: &MemoryObject, class_addr: u64) -> Result<u64, ObjcError> {
    let class: ClassT = read(memory, class_addr)?;
    Ok(class.isa)
}

/// Resolves the handful of `class_ro_t` fields the cache wants to
/// remember, without building a full [`ParsedClass`] (i.e. without
/// reading the name string or walking the method list).
pub fn resolve_ro_fields(
    memory: &MemoryObject,
    class_addr: u64,
) -> Result<(u64, u64, u64), ObjcError> {
    let class: ClassT = read(memory, class_addr)?;
    const FAST_DATA_MASK: u64 = !0x7;
    let ro_addr = resolve_ro_addr(memory, class.data & FAST_DATA_MASK)?;
    let ro: ClassRoT = read(memory, ro_addr)?;
    Ok((ro.name, ro.base_method_list, class.superclass))
}
