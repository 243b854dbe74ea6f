/// Runtime support entry points for natively lowered modules
///
/// Generated code reaches these functions in two ways:
/// - direct calls to declared symbols (`call @__rt_alloc 1`), resolved when the JIT
///   finalizes relocations or by the static linker for object files
/// - context slots (`__ctx_alloc`, ...) that the JIT fills with the addresses below
///
/// Every entry point uses the C ABI with 64-bit integer or pointer arguments so the
/// lowering backends can pass values straight from their evaluation stack.
use std::alloc::{alloc, dealloc, Layout};
use std::cell::RefCell;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::Mutex;

const HEADER_SIZE: usize = 16;
const ALLOC_ALIGN: usize = 16;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

static SYSTEM_LIBS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

/// Allocate `size` bytes, 16-byte aligned. Returns null for zero or oversized requests.
#[no_mangle]
pub extern "C" fn __rt_alloc(size: u64) -> *mut u8 {
    if size == 0 || size > (isize::MAX as u64) - HEADER_SIZE as u64 {
        return std::ptr::null_mut();
    }
    let total = size as usize + HEADER_SIZE;
    let layout = match Layout::from_size_align(total, ALLOC_ALIGN) {
        Ok(layout) => layout,
        Err(_) => return std::ptr::null_mut(),
    };

    unsafe {
        let base = alloc(layout);
        if base.is_null() {
            return base;
        }
        // header keeps the total size so __rt_free can rebuild the layout
        (base as *mut u64).write(total as u64);
        base.add(HEADER_SIZE)
    }
}

/// Release memory obtained from [`__rt_alloc`]. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by `__rt_alloc` that was not freed yet.
#[no_mangle]
pub unsafe extern "C" fn __rt_free(ptr: *mut u8) -> i64 {
    if ptr.is_null() {
        return 0;
    }
    let base = ptr.sub(HEADER_SIZE);
    let total = (base as *const u64).read() as usize;
    dealloc(base, Layout::from_size_align_unchecked(total, ALLOC_ALIGN));
    0
}

/// Record an error message for the calling thread. Returns -1 so generated code can
/// propagate it as a failure status.
///
/// # Safety
///
/// `message` must be null or point to a NUL-terminated byte sequence.
#[no_mangle]
pub unsafe extern "C" fn __rt_set_last_error(message: *const c_char) -> i64 {
    let text = if message.is_null() {
        String::from("unknown error")
    } else {
        CStr::from_ptr(message).to_string_lossy().into_owned()
    };

    #[cfg(feature = "debug")]
    eprintln!("[nativemod-runtime] last error: {}", text);

    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(text));
    -1
}

/// Self-registration hook called by the startup constructor of system-lib modules.
/// `registry` points to a `[names, funcs]` descriptor, see [`read_registry`].
#[no_mangle]
pub extern "C" fn __rt_register_system_lib(registry: *const u8) -> i64 {
    if registry.is_null() {
        return -1;
    }
    let mut libs = match SYSTEM_LIBS.lock() {
        Ok(libs) => libs,
        Err(poisoned) => poisoned.into_inner(),
    };
    if !libs.contains(&(registry as usize)) {
        libs.push(registry as usize);
    }
    0
}

/// Names and addresses of every runtime support entry point.
pub fn support_symbols() -> [(&'static str, usize); 4] {
    [
        ("__rt_alloc", __rt_alloc as *const () as usize),
        ("__rt_free", __rt_free as *const () as usize),
        ("__rt_set_last_error", __rt_set_last_error as *const () as usize),
        ("__rt_register_system_lib", __rt_register_system_lib as *const () as usize),
    ]
}

/// Address of the runtime support entry point called `name`.
pub fn lookup(name: &str) -> Option<usize> {
    support_symbols().iter().find(|(symbol, _)| *symbol == name).map(|(_, address)| *address)
}

/// Take the last error recorded on this thread.
pub fn take_last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

/// Registry descriptors registered so far by system-lib startup constructors.
pub fn registered_system_libs() -> Vec<usize> {
    match SYSTEM_LIBS.lock() {
        Ok(libs) => libs.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Decode a function registry descriptor.
///
/// Layout: two pointers, `names` then `funcs`. `names` starts with a little-endian u16
/// count followed by that many NUL-terminated names; `funcs` holds one address per name.
///
/// # Safety
///
/// `registry` must point to a live descriptor produced by a registry module.
pub unsafe fn read_registry(registry: *const u8) -> Vec<(String, usize)> {
    let words = registry as *const usize;
    let names = words.read() as *const u8;
    let funcs = words.add(1).read() as *const usize;

    let count = u16::from_le_bytes([names.read(), names.add(1).read()]) as usize;
    let mut cursor = names.add(2);
    let mut entries = Vec::with_capacity(count);
    for index in 0..count {
        let name = CStr::from_ptr(cursor as *const c_char);
        let bytes = name.to_bytes();
        cursor = cursor.add(bytes.len() + 1);
        entries.push((String::from_utf8_lossy(bytes).into_owned(), funcs.add(index).read()));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_round_trip() {
        let ptr = __rt_alloc(64);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % ALLOC_ALIGN, 0);
        unsafe {
            ptr.write_bytes(0xab, 64);
            assert_eq!(__rt_free(ptr), 0);
        }
    }

    #[test]
    fn zero_sized_alloc_is_null() {
        assert!(__rt_alloc(0).is_null());
    }

    #[test]
    fn last_error_is_thread_local() {
        let message = b"boom\0";
        let status = unsafe { __rt_set_last_error(message.as_ptr() as *const c_char) };
        assert_eq!(status, -1);

        let other = std::thread::spawn(take_last_error).join().unwrap();
        assert_eq!(other, None);
        assert_eq!(take_last_error().as_deref(), Some("boom"));
        assert_eq!(take_last_error(), None);
    }

    #[test]
    fn lookup_finds_support_symbols() {
        assert_eq!(lookup("__rt_alloc"), Some(__rt_alloc as *const () as usize));
        assert_eq!(lookup("memcpy"), None);
    }

    #[test]
    fn registry_descriptor_decodes() {
        let mut names = vec![2u8, 0];
        names.extend_from_slice(b"f1\0f22\0");
        let funcs: [usize; 2] = [0x1000, 0x2000];
        let descriptor: [usize; 2] = [names.as_ptr() as usize, funcs.as_ptr() as usize];

        assert_eq!(__rt_register_system_lib(descriptor.as_ptr() as *const u8), 0);
        assert!(registered_system_libs().contains(&(descriptor.as_ptr() as usize)));

        let entries = unsafe { read_registry(descriptor.as_ptr() as *const u8) };
        assert_eq!(entries, vec![("f1".to_string(), 0x1000), ("f22".to_string(), 0x2000)]);
    }
}
