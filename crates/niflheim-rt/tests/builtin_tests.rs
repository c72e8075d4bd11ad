//! Round-trip tests for the built-in heap types, driven through the
//! `extern "C"` surface.

use std::ptr;

use parking_lot::Mutex;

use niflheim_rt::ThreadState;
use niflheim_rt::builtins::array::{
    rt_array_get_i64, rt_array_get_ref, rt_array_get_u8, rt_array_len_i64, rt_array_len_u8,
    rt_array_new_i64, rt_array_new_ref, rt_array_new_u8, rt_array_set_i64, rt_array_set_ref,
    rt_array_set_u8, rt_array_slice_u8,
};
use niflheim_rt::builtins::boxes::{
    rt_box_bool_get, rt_box_bool_new, rt_box_double_get, rt_box_double_new, rt_box_i64_get,
    rt_box_i64_new, rt_box_u8_get, rt_box_u8_new, rt_box_u64_get, rt_box_u64_new,
};
use niflheim_rt::builtins::str::{
    rt_str_concat, rt_str_eq, rt_str_from_bytes, rt_str_get_u8, rt_str_len, rt_str_slice,
};
use niflheim_rt::builtins::strbuf::{
    rt_strbuf_len, rt_strbuf_new, rt_strbuf_push_str, rt_strbuf_push_u8, rt_strbuf_to_str,
};
use niflheim_rt::builtins::vec::{rt_vec_get, rt_vec_len, rt_vec_new, rt_vec_push, rt_vec_set};
use niflheim_rt::context::{rt_gc_reset_state, rt_init, rt_thread_state};
use niflheim_rt::roots::{rt_push_roots, rt_root_frame_init, rt_root_slot_store};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn setup() -> *mut ThreadState {
    rt_init();
    rt_gc_reset_state();
    rt_thread_state()
}

/// A root frame over a fixed slot array, pushed for the scope of a test.
/// Tests here never pop; `rt_gc_reset_state` clears the stack.
struct TestRoots<const N: usize> {
    slots: [*mut u8; N],
    frame: niflheim_rt::RootFrame,
}

impl<const N: usize> TestRoots<N> {
    fn new() -> Box<Self> {
        let mut roots = Box::new(Self {
            slots: [ptr::null_mut(); N],
            frame: niflheim_rt::RootFrame {
                prev: ptr::null_mut(),
                slot_count: 0,
                slots: ptr::null_mut(),
            },
        });
        let ts = rt_thread_state();
        // SAFETY: the box keeps frame and slots alive for the whole test.
        unsafe {
            rt_root_frame_init(&raw mut roots.frame, roots.slots.as_mut_ptr(), N as u64);
            rt_push_roots(ts, &raw mut roots.frame);
        }
        roots
    }

    fn hold(&mut self, i: u64, obj: *mut u8) {
        // SAFETY: the frame covers N slots.
        unsafe { rt_root_slot_store(&raw mut self.frame, i, obj) };
    }
}

#[test]
fn str_round_trip() {
    let _guard = TEST_LOCK.lock();
    let ts = setup();
    let bytes = b"niflheim";

    // SAFETY: ts is valid; bytes covers len readable bytes.
    unsafe {
        let s = rt_str_from_bytes(ts, bytes.as_ptr(), bytes.len() as u64);
        assert_eq!(rt_str_len(s), bytes.len() as u64);
        for (i, &b) in bytes.iter().enumerate() {
            assert_eq!(rt_str_get_u8(s, i as u64), b);
        }
    }
}

#[test]
fn str_slice_concat_eq() {
    let _guard = TEST_LOCK.lock();
    let ts = setup();
    let mut roots = TestRoots::<3>::new();

    // SAFETY: ts is valid; every operand is rooted before the next
    // allocating call.
    unsafe {
        let hello = rt_str_from_bytes(ts, b"hello ".as_ptr(), 6);
        roots.hold(0, hello);
        let world = rt_str_from_bytes(ts, b"world".as_ptr(), 5);
        roots.hold(1, world);

        let joined = rt_str_concat(ts, hello, world);
        roots.hold(2, joined);
        assert_eq!(rt_str_len(joined), 11);

        let tail = rt_str_slice(ts, joined, 6, 11);
        assert!(rt_str_eq(tail, world));
        assert!(!rt_str_eq(tail, hello));
    }
}

#[test]
fn box_round_trips() {
    let _guard = TEST_LOCK.lock();
    let ts = setup();

    // SAFETY: ts is valid.
    unsafe {
        assert_eq!(rt_box_i64_get(rt_box_i64_new(ts, -7)), -7);
        assert_eq!(rt_box_u64_get(rt_box_u64_new(ts, u64::MAX)), u64::MAX);
        assert_eq!(rt_box_u8_get(rt_box_u8_new(ts, 255)), 255);
        assert!(rt_box_bool_get(rt_box_bool_new(ts, true)));
        assert_eq!(rt_box_double_get(rt_box_double_new(ts, 2.5)), 2.5);
    }
}

#[test]
fn i64_array_set_get() {
    let _guard = TEST_LOCK.lock();
    let ts = setup();

    // SAFETY: ts is valid; indices are in bounds.
    unsafe {
        let arr = rt_array_new_i64(ts, 4);
        assert_eq!(rt_array_len_i64(arr), 4);
        // Fresh arrays are zero-filled.
        assert_eq!(rt_array_get_i64(arr, 3), 0);
        rt_array_set_i64(arr, 2, -99);
        assert_eq!(rt_array_get_i64(arr, 2), -99);
    }
}

#[test]
fn u8_slice_is_independent_of_source() {
    let _guard = TEST_LOCK.lock();
    let ts = setup();
    let mut roots = TestRoots::<1>::new();

    // SAFETY: ts is valid; arr is rooted before the slice allocates.
    unsafe {
        let arr = rt_array_new_u8(ts, 4);
        roots.hold(0, arr);
        rt_array_set_u8(arr, 0, 9);
        rt_array_set_u8(arr, 1, 7);

        let s = rt_array_slice_u8(ts, arr, 0, 2);
        assert_eq!(rt_array_len_u8(s), 2);

        // Mutating the source must not show through the slice.
        rt_array_set_u8(arr, 0, 1);
        assert_eq!(rt_array_get_u8(s, 0), 9);
        assert_eq!(rt_array_get_u8(s, 1), 7);
    }
}

#[test]
fn ref_array_holds_and_returns_references() {
    let _guard = TEST_LOCK.lock();
    let ts = setup();
    let mut roots = TestRoots::<1>::new();

    // SAFETY: ts is valid; arr is rooted before the box allocates.
    unsafe {
        let arr = rt_array_new_ref(ts, 2);
        roots.hold(0, arr);
        assert!(rt_array_get_ref(arr, 0).is_null());

        let boxed = rt_box_i64_new(ts, 5);
        rt_array_set_ref(arr, 1, boxed);
        assert_eq!(rt_array_get_ref(arr, 1), boxed);
        assert_eq!(rt_box_i64_get(rt_array_get_ref(arr, 1)), 5);
    }
}

#[test]
fn vec_push_sequence() {
    let _guard = TEST_LOCK.lock();
    let ts = setup();
    let mut roots = TestRoots::<2>::new();

    // SAFETY: ts is valid; v and each pushed value are rooted across the
    // allocating push.
    unsafe {
        let v = rt_vec_new(ts);
        roots.hold(0, v);
        assert_eq!(rt_vec_len(v), 0);

        // Push enough to force at least one storage growth.
        let n = 20;
        for i in 0..n {
            let boxed = rt_box_i64_new(ts, i);
            roots.hold(1, boxed);
            rt_vec_push(ts, v, boxed);
        }
        roots.hold(1, ptr::null_mut());

        assert_eq!(rt_vec_len(v), n as u64);
        for i in 0..n {
            assert_eq!(rt_box_i64_get(rt_vec_get(v, i as u64)), i);
        }

        rt_vec_set(v, 3, ptr::null_mut());
        assert!(rt_vec_get(v, 3).is_null());
    }
}

#[test]
fn strbuf_builds_strings() {
    let _guard = TEST_LOCK.lock();
    let ts = setup();
    let mut roots = TestRoots::<2>::new();

    // SAFETY: ts is valid; the buffer and source string are rooted across
    // every allocating call.
    unsafe {
        let sb = rt_strbuf_new(ts);
        roots.hold(0, sb);
        assert_eq!(rt_strbuf_len(sb), 0);

        for &b in b"ab" {
            rt_strbuf_push_u8(ts, sb, b);
        }
        let suffix = rt_str_from_bytes(ts, b"cdef".as_ptr(), 4);
        roots.hold(1, suffix);
        rt_strbuf_push_str(ts, sb, suffix);
        assert_eq!(rt_strbuf_len(sb), 6);

        let s = rt_strbuf_to_str(ts, sb);
        assert_eq!(rt_str_len(s), 6);
        for (i, &b) in b"abcdef".iter().enumerate() {
            assert_eq!(rt_str_get_u8(s, i as u64), b);
        }
    }
}
