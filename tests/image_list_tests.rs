//! Exercises [`ImageList`] as an external caller would: publishing images,
//! tombstoning, draining, and concurrent reads while a writer is active.

use crashcorder_core::image::{Image, ImageList};
use std::ffi::CString;
use std::sync::Arc;
use std::thread;

fn image_at(base: u64, size: u64) -> Image {
    let image = Image::new(base, 0, CString::new(format!("/usr/lib/lib{base:x}.dylib")).unwrap());
    image.set_size(size);
    image
}

#[test]
fn images_appended_from_multiple_threads_are_all_visible() {
    let list = Arc::new(ImageList::new());
    let mut handles = Vec::new();
    for i in 0..8u64 {
        let list = Arc::clone(&list);
        handles.push(thread::spawn(move || {
            list.append(image_at(0x10000 * (i + 1), 0x1000));
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for i in 0..8u64 {
        let base = 0x10000 * (i + 1);
        assert!(list.find_by_base(base).is_some(), "missing image at {base:#x}");
    }
}

#[test]
fn reader_sees_a_stable_snapshot_during_concurrent_append() {
    let list = Arc::new(ImageList::new());
    list.append(image_at(0x1000, 0x1000));

    let writer_list = Arc::clone(&list);
    let writer = thread::spawn(move || {
        for i in 1..100u64 {
            writer_list.append(image_at(0x1000 + i * 0x2000, 0x1000));
        }
    });

    // A reader racing the writer must never see a torn node: every image it
    // observes should be fully initialized (non-empty path, valid size).
    for _ in 0..50 {
        for image in list.iter() {
            assert!(image.size().is_some());
            assert!(!image.path().as_bytes().is_empty());
        }
    }

    writer.join().unwrap();
    assert!(list.find_by_base(0x1000).is_some());
}

#[test]
fn remove_then_drain_releases_the_tombstoned_node_only() {
    let mut list = ImageList::new();
    for i in 0..5u64 {
        list.append(image_at(0x1000 * (i + 1), 0x500));
    }
    list.remove(0x3000);
    list.remove(0x5000);

    // Tombstoned entries are invisible to address lookups immediately...
    assert!(list.find_by_address(0x3000).is_none());
    assert!(list.find_by_address(0x5000).is_none());
    // ...but still findable by base until drained.
    assert!(list.find_by_base(0x3000).is_some());

    list.drain();
    assert!(list.find_by_base(0x3000).is_none());
    assert!(list.find_by_base(0x5000).is_none());
    // The three untouched images survive the drain.
    assert!(list.find_by_base(0x1000).is_some());
    assert!(list.find_by_base(0x2000).is_some());
    assert!(list.find_by_base(0x4000).is_some());
}

#[test]
fn dropping_a_list_with_live_and_tombstoned_nodes_does_not_leak_or_panic() {
    let list = ImageList::new();
    list.append(image_at(0x1000, 0x100));
    list.append(image_at(0x2000, 0x100));
    list.append(image_at(0x3000, 0x100));
    list.remove(0x2000);
    drop(list);
}
