//! Exercises [`MemoryObject`] from outside the crate: establishing a view
//! over the calling process's own memory, translating offsets, and the
//! page-rounding behavior that lets a request start mid-page.

use crashcorder_core::mobject::MemoryObject;

#[test]
fn as_slice_matches_the_source_bytes_exactly() {
    let source: Vec<u8> = (0..=255u8).collect();
    let addr = source.as_ptr() as u64;
    let mo = MemoryObject::for_self(addr, source.len() as u64).unwrap();
    assert_eq!(mo.as_slice(), &source[..]);
}

#[test]
fn a_request_starting_mid_page_still_reads_correctly() {
    // Allocate more than one page so the requested range is guaranteed to
    // start somewhere other than a page boundary.
    let page = 4096usize;
    let mut buf = vec![0u8; page * 3];
    for (i, b) in buf.iter_mut().enumerate() {
        *b = (i % 256) as u8;
    }
    let mid_page_offset = page + 17;
    let addr = buf.as_ptr() as u64 + mid_page_offset as u64;

    let mo = MemoryObject::for_self(addr, 64).unwrap();
    let expected = &buf[mid_page_offset..mid_page_offset + 64];
    assert_eq!(mo.as_slice(), expected);
}

#[test]
fn translate_slice_matches_a_direct_subslice() {
    let buf: Vec<u8> = (0..128u8).collect();
    let addr = buf.as_ptr() as u64;
    let mo = MemoryObject::for_self(addr, buf.len() as u64).unwrap();

    let got = mo.translate_slice(16, 32).unwrap();
    assert_eq!(got, &buf[16..48]);
    assert!(mo.translate_slice(100, 64).is_none());
}

#[test]
fn zero_length_request_is_rejected() {
    let x = 0u64;
    let addr = &x as *const u64 as u64;
    assert!(MemoryObject::for_self(addr, 0).is_err());
}
