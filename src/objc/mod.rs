//! Objective-C metadata parser and best-IMP symbolicator.
//!
//! Turns a return address into "this is `-[MyClass myMethod:]`" by
//! walking each loaded image's class list and picking the method whose
//! implementation address is the closest one not past the target address
//! -- there's no size field on a method, so "contains this address" is
//! approximated as "is the last method whose IMP we saw before it".
//!
//! Handles both runtime generations: [`objc2`] for every image built
//! against a modern SDK, and [`objc1`] as a fallback for 32-bit images
//! old enough to still carry the legacy module format. [`cache`] memoizes
//! the per-class lookups so a multi-frame unwind landing repeatedly in
//! one class's methods doesn't re-walk its `class_ro_t` each time.

pub mod cache;
mod objc1;
mod objc2;

use crate::mobject::MemoryObject;
use cache::{CachedClassInfo, ClassRoCache};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjcError {
    #[error("address is outside the mapped memory object")]
    OutOfRange,
    #[error("a class or method name was not a valid, nul-terminated string")]
    MalformedString,
    #[error("no class in the known image set covers this address")]
    NoCoverage,
}

/// A symbolicated address: which class, which method, and where that
/// method's implementation actually starts.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub class_name: String,
    pub method_name: String,
    pub imp_addr: u64,
    /// `true` if this was a class (`+`) method rather than an instance
    /// (`-`) method.
    pub is_class_method: bool,
}

/// One image's classlist, as located by [`crate::macho::MachOReader`]:
/// either the modern `__DATA,__objc_classlist` pointer array, or the
/// legacy `__OBJC,__module_info` blob.
pub enum ClassSource {
    Modern { classlist_addr: u64, count: u64 },
    Legacy { module_info_addr: u64, module_info_size: u64 },
}

/// Symbolicates addresses against one or more images' ObjC metadata.
pub struct Symbolicator<'a> {
    memory: &'a MemoryObject,
    cache: ClassRoCache,
}

impl<'a> Symbolicator<'a> {
    pub fn new(memory: &'a MemoryObject) -> Self {
        Self {
            memory,
            cache: ClassRoCache::new(),
        }
    }

    fn cached_ro_fields(&mut self, class_addr: u64) -> Result<CachedClassInfo, ObjcError> {
        if let Some(info) = self.cache.get(class_addr) {
            return Ok(info);
        }
        let (name_addr, method_list_addr, superclass_addr) =
            objc2::resolve_ro_fields(self.memory, class_addr)?;
        let info = CachedClassInfo {
            class_addr,
            name_addr,
            method_list_addr,
            superclass_addr,
        };
        self.cache.insert(info);
        Ok(info)
    }

    /// Finds the best symbol covering `addr` across every class in
    /// `source`. Two passes: instance methods first, then each class's
    /// metaclass (static methods), keeping whichever candidate's IMP is
    /// closest to (but not past) `addr` across both passes.
    pub fn best_symbol(&mut self, source: &ClassSource, addr: u64) -> Result<Symbol, ObjcError> {
        let class_addrs = self.class_addrs(source)?;

        let mut best: Option<Symbol> = None;

        // Pass 1: instance methods.
        for &class_addr in &class_addrs {
            if class_addr == 0 {
                continue;
            }
            self.consider_class(class_addr, addr, false, &mut best)?;
        }

        // Pass 2: class (static) methods, via each class's metaclass.
        if matches!(source, ClassSource::Modern { .. }) {
            for &class_addr in &class_addrs {
                if class_addr == 0 {
                    continue;
                }
                if let Ok(metaclass_addr) = objc2::metaclass_of(self.memory, class_addr) {
                    if metaclass_addr != 0 {
                        self.consider_class(metaclass_addr, addr, true, &mut best)?;
                    }
                }
            }
        }

        best.ok_or(ObjcError::NoCoverage)
    }

    fn class_addrs(&self, source: &ClassSource) -> Result<Vec<u64>, ObjcError> {
        match *source {
            ClassSource::Modern {
                classlist_addr,
                count,
            } => objc2::iter_classlist(self.memory, classlist_addr, count),
            ClassSource::Legacy {
                module_info_addr,
                module_info_size,
            } => Ok(objc1::enumerate_classes(self.memory, module_info_addr, module_info_size)?
                .into_iter()
                .map(u64::from)
                .collect()),
        }
    }

    fn consider_class(
        &mut self,
        class_addr: u64,
        target_addr: u64,
        is_class_method: bool,
        best: &mut Option<Symbol>,
    ) -> Result<(), ObjcError> {
        let info = match self.cached_ro_fields(class_addr) {
            Ok(info) => info,
            Err(_) => return Ok(()), // one bad class shouldn't sink the whole lookup
        };

        let methods = match objc2::parse_class(self.memory, class_addr) {
            Ok(parsed) => parsed.methods,
            Err(_) => return Ok(()),
        };
        let class_name =
            objc2_name_or(self.memory, info.name_addr).unwrap_or_else(|| "<unknown>".into());

        for method in methods {
            if method.imp > target_addr {
                continue;
            }
            let is_better = match best {
                None => true,
                Some(current) => method.imp > current.imp_addr,
            };
            if is_better {
                *best = Some(Symbol {
                    class_name: class_name.clone(),
                    method_name: method.name,
                    imp_addr: method.imp,
                    is_class_method,
                });
            }
        }
        Ok(())
    }
}

fn objc2_name_or(memory: &MemoryObject, name_addr: u64) -> Option<String> {
    let offset = name_addr.checked_sub(memory.task_address())?;
    let bytes = memory.translate_slice(offset, 512)?;
    let end = bytes.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_classlist_has_no_coverage() {
        let buf = [0u8; 8];
        let memory = MemoryObject::for_self(buf.as_ptr() as u64, 8).unwrap();
        let mut symbolicator = Symbolicator::new(&memory);
        let source = ClassSource::Modern {
            classlist_addr: buf.as_ptr() as u64,
            count: 0,
        };
        assert!(matches!(
            symbolicator.best_symbol(&source, 0x1000),
            Err(ObjcError::NoCoverage)
        ));
    }
}
