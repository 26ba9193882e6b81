//! C FFI: exposes the process-wide [`TtsEngine`](crate::engine::TtsEngine)
//! to non-Rust hosts.
//!
//! Functions are `#[no_mangle] extern "C"` so a plain C header is enough to
//! call them. The engine is loaded from the `TTS_*` environment variables on
//! the first call and reused afterwards.
//!
//! ## Memory contract
//!
//! | Function                         | Caller frees with         |
//! |----------------------------------|---------------------------|
//! | [`kinyatts_synthesize_to_file`]  | [`kinyatts_free_error`]   |

use std::ffi::{c_char, CStr, CString};

use anyhow::Result;

use crate::engine::{self, Synthesis};

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Convert a `*const c_char` to an owned `String` (lossy UTF-8).
/// Returns `None` if `ptr` is null.
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Heap-allocate an owned C string.  Returns null on interior nul bytes.
fn to_c_str(s: &str) -> *const c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => std::ptr::null(),
    }
}

/// Argument checking and file output shared by the exported entry point and
/// its tests; `synth` performs the actual synthesis.
unsafe fn synthesize_to_file_with(
    synth: impl FnOnce(&str, Option<&str>) -> Result<Synthesis>,
    text: *const c_char,
    speaker_id: *const c_char,
    output_path: *const c_char,
    latency_ms: *mut f64,
) -> *const c_char {
    macro_rules! bail {
        ($msg:literal) => {
            return to_c_str($msg);
        };
        ($fmt:expr, $($arg:tt)*) => {
            return to_c_str(&format!($fmt, $($arg)*));
        };
    }

    let (Some(txt), Some(out)) =
        (unsafe { cstr_to_string(text) }, unsafe { cstr_to_string(output_path) })
    else {
        bail!("null argument (text or output_path)");
    };
    let speaker = unsafe { cstr_to_string(speaker_id) };

    let synthesis = match synth(&txt, speaker.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            bail!("{:#}", e);
        }
    };
    if let Err(e) = std::fs::write(&out, &synthesis.wav_bytes) {
        bail!("cannot write {}: {}", out, e);
    }
    if !latency_ms.is_null() {
        unsafe { *latency_ms = synthesis.latency_ms };
    }
    std::ptr::null()
}

// ─── Public API ──────────────────────────────────────────────────────────────

/// Synthesise `text` and write a 16-bit PCM WAV to `output_path`.
///
/// @param text         UTF-8 text to speak.
/// @param speaker_id   Decimal speaker id, or `NULL` for the default voice.
/// @param output_path  Writable path for the `.wav` file.
/// @param latency_ms   Optional out-parameter receiving the model time in
///                     milliseconds; may be `NULL`.
/// @return             `NULL` on success; otherwise a heap-allocated UTF-8
///                     error message that the caller must release with
///                     [`kinyatts_free_error`].
#[no_mangle]
pub unsafe extern "C" fn kinyatts_synthesize_to_file(
    text: *const c_char,
    speaker_id: *const c_char,
    output_path: *const c_char,
    latency_ms: *mut f64,
) -> *const c_char {
    unsafe { synthesize_to_file_with(engine::synthesize, text, speaker_id, output_path, latency_ms) }
}

/// Free an error string returned by [`kinyatts_synthesize_to_file`].
#[no_mangle]
pub unsafe extern "C" fn kinyatts_free_error(s: *const c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s as *mut c_char) });
    }
}
