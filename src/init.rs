use std::sync::Once;

use rsmpeg::ffi;

static DEVICE_REGISTRATION: Once = Once::new();

/// Register ffmpeg's capture devices with the process. Safe to call any
/// number of times from any thread; registration happens once. Demuxer
/// construction calls this implicitly, but callers that want to front-load
/// the work can invoke it themselves.
pub fn init() {
    DEVICE_REGISTRATION.call_once(|| unsafe {
        ffi::avdevice_register_all();
    });
}
